//! Compact node and peer info (BEP-5).
//!
//! Nodes are packed as 26-byte records (20-byte id, 4-byte IPv4 address,
//! 2-byte port) and peers as 6-byte records, all in network byte order.
//! IPv6 contacts are not representable and are skipped when packing.

use super::error::DhtError;
use super::node::{NodeId, NodeInfo};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const COMPACT_NODE_LEN: usize = 26;
pub const COMPACT_PEER_LEN: usize = 6;

pub fn pack_nodes(nodes: &[NodeInfo]) -> Bytes {
    let mut buf = BytesMut::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        if let SocketAddr::V4(v4) = node.addr {
            buf.put_slice(node.id.as_bytes());
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
    }
    buf.freeze()
}

pub fn unpack_nodes(data: &[u8]) -> Result<Vec<NodeInfo>, DhtError> {
    if data.len() % COMPACT_NODE_LEN != 0 {
        return Err(DhtError::Decoding(format!(
            "compact node info length {} is not a multiple of {}",
            data.len(),
            COMPACT_NODE_LEN
        )));
    }

    data.chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| {
            let id = NodeId::from_bytes(&chunk[..20])?;
            Ok(NodeInfo::new(id, socket_addr(&chunk[20..])))
        })
        .collect()
}

pub fn pack_peer(addr: &SocketAddr) -> Option<Bytes> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = BytesMut::with_capacity(COMPACT_PEER_LEN);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
            Some(buf.freeze())
        }
        SocketAddr::V6(_) => None,
    }
}

pub fn unpack_peer(data: &[u8]) -> Result<SocketAddr, DhtError> {
    if data.len() != COMPACT_PEER_LEN {
        return Err(DhtError::Decoding(format!(
            "compact peer info must be {} bytes, got {}",
            COMPACT_PEER_LEN,
            data.len()
        )));
    }
    Ok(socket_addr(data))
}

fn socket_addr(data: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    SocketAddr::new(IpAddr::V4(ip), port)
}
