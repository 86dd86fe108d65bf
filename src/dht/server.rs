use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tracing::debug;

use super::config::DhtContext;
use super::message::{InfoHash, KrpcError, Query, Response};
use super::node::{Node, NodeId, NodeInfo};
use super::routing::RoutingTable;
use super::transport::QueryHandler;
use crate::constants::{MAX_PEERS_PER_RESPONSE, TOKEN_LEN};

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Peers announced to us, per info hash.
///
/// Both the number of info hashes and the peers per hash are capped. When a
/// new hash arrives at a full store, expired entries are swept first and then
/// the hash with the oldest latest announce is dropped.
struct PeerStore {
    peers: HashMap<InfoHash, Vec<AnnouncedPeer>>,
    max_info_hashes: usize,
    max_per_torrent: usize,
    lifetime: Duration,
}

impl PeerStore {
    fn new(max_info_hashes: usize, max_per_torrent: usize, lifetime: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            max_info_hashes: max_info_hashes.max(1),
            max_per_torrent,
            lifetime,
        }
    }

    fn add_peer(&mut self, info_hash: InfoHash, addr: SocketAddr) {
        if !self.peers.contains_key(&info_hash) && self.peers.len() >= self.max_info_hashes {
            self.expire();
            if self.peers.len() >= self.max_info_hashes {
                self.evict_stalest();
            }
        }

        let lifetime = self.lifetime;
        let peers = self.peers.entry(info_hash).or_default();

        let now = Instant::now();
        peers.retain(|p| now.duration_since(p.announced_at) < lifetime && p.addr != addr);

        if peers.len() < self.max_per_torrent {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: now,
            });
        }
    }

    fn get_peers(&mut self, info_hash: &InfoHash, limit: usize) -> Vec<SocketAddr> {
        let lifetime = self.lifetime;
        let Some(peers) = self.peers.get_mut(info_hash) else {
            return Vec::new();
        };

        let now = Instant::now();
        peers.retain(|p| now.duration_since(p.announced_at) < lifetime);
        let found: Vec<SocketAddr> = peers.iter().rev().take(limit).map(|p| p.addr).collect();
        if peers.is_empty() {
            self.peers.remove(info_hash);
        }
        found
    }

    /// Drops expired peers across every info hash. Returns how many went.
    fn expire(&mut self) -> usize {
        let lifetime = self.lifetime;
        let now = Instant::now();
        let mut removed = 0;

        self.peers.retain(|_, peers| {
            let before = peers.len();
            peers.retain(|p| now.duration_since(p.announced_at) < lifetime);
            removed += before - peers.len();
            !peers.is_empty()
        });
        removed
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .peers
            .iter()
            .min_by_key(|(_, peers)| peers.iter().map(|p| p.announced_at).max())
            .map(|(hash, _)| *hash);

        if let Some(hash) = stalest {
            self.peers.remove(&hash);
            debug!(info_hash = %hex::encode(hash), "peer store full, dropped info hash");
        }
    }
}

/// Secrets announce tokens are derived from. Tokens made with the previous
/// secret stay valid for one rotation.
struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }

    fn token(secret: &[u8; 16], addr: &SocketAddr) -> Bytes {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        hasher.update(addr.ip().to_string().as_bytes());

        let digest = hasher.finalize();
        Bytes::copy_from_slice(&digest[..TOKEN_LEN])
    }
}

/// Answers incoming queries from the routing table and the peer store.
///
/// Every well-formed query also counts as contact with its sender, which is
/// offered to the routing table without probing anyone.
pub struct QueryServer {
    context: Arc<DhtContext>,
    routing: Arc<RoutingTable>,
    secrets: RwLock<TokenSecrets>,
    peer_store: RwLock<PeerStore>,
}

impl QueryServer {
    pub fn new(context: Arc<DhtContext>, routing: Arc<RoutingTable>) -> Self {
        let peer_store = PeerStore::new(
            context.config.max_info_hashes,
            context.config.max_peers_per_torrent,
            context.config.peer_announce_lifetime,
        );
        Self {
            context,
            routing,
            secrets: RwLock::new(TokenSecrets::new()),
            peer_store: RwLock::new(peer_store),
        }
    }

    /// The token a node at `addr` must present to announce to us.
    pub fn token_for(&self, addr: &SocketAddr) -> Bytes {
        TokenSecrets::token(&self.secrets.read().current, addr)
    }

    pub fn validate_token(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        let secrets = self.secrets.read();
        TokenSecrets::token(&secrets.current, addr) == token
            || TokenSecrets::token(&secrets.previous, addr) == token
    }

    pub fn rotate_token_secret(&self) {
        self.secrets.write().rotate();
        debug!("DHT token secret rotated");
    }

    /// Announced peers for `info_hash`, newest first.
    pub fn stored_peers(&self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        self.peer_store
            .write()
            .get_peers(info_hash, MAX_PEERS_PER_RESPONSE)
    }

    /// Number of info hashes with stored peers.
    pub fn stored_info_hash_count(&self) -> usize {
        self.peer_store.read().peers.len()
    }

    /// Sweeps expired announces out of the peer store.
    pub fn expire_peers(&self) {
        let removed = self.peer_store.write().expire();
        if removed > 0 {
            debug!(removed, "expired announced peers");
        }
    }

    fn closest(&self, target: &NodeId) -> Vec<NodeInfo> {
        self.routing.closest_live_nodes(target, self.routing.capacity())
    }

    fn announce(
        &self,
        from: SocketAddr,
        info_hash: InfoHash,
        port: u16,
        token: &[u8],
        implied_port: bool,
    ) -> Result<Response, KrpcError> {
        if !self.validate_token(&from, token) {
            debug!(%from, "rejecting announce_peer with invalid token");
            return Err(KrpcError::protocol("invalid token"));
        }

        let port = if implied_port { from.port() } else { port };
        if port == 0 {
            return Err(KrpcError::protocol("invalid port"));
        }

        let peer = SocketAddr::new(from.ip(), port);
        self.peer_store.write().add_peer(info_hash, peer);
        debug!(%peer, info_hash = %hex::encode(info_hash), "stored announced peer");

        Ok(Response::AnnouncePeer {
            id: self.context.local_id,
        })
    }
}

impl QueryHandler for QueryServer {
    fn handle(&self, from: SocketAddr, sender: NodeId, query: Query) -> Result<Response, KrpcError> {
        self.routing.observe(Node::new(NodeInfo::new(sender, from)));
        let id = self.context.local_id;

        match query {
            Query::Ping => Ok(Response::Ping { id }),
            Query::FindNode { target } => Ok(Response::FindNode {
                id,
                nodes: self.closest(&target),
            }),
            Query::GetPeers { info_hash } => {
                let peers = self.stored_peers(&info_hash);
                Ok(Response::GetPeers {
                    id,
                    token: self.token_for(&from),
                    nodes: Some(self.closest(&NodeId(info_hash))),
                    peers: (!peers.is_empty()).then_some(peers),
                })
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => self.announce(from, info_hash, port, &token, implied_port),
        }
    }
}
