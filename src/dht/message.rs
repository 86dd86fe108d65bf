//! KRPC messages ([BEP-5]).
//!
//! Every message is a bencoded dictionary with a transaction id `t` and a
//! type `y` of `q` (query), `r` (response) or `e` (error). Responses do not
//! name the method they answer, so [`KrpcMessage::decode`] takes a lookup
//! from transaction id to the method of the pending query.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use super::compact;
use super::error::DhtError;
use super::node::{NodeId, NodeInfo};
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

pub type TransactionId = Bytes;

pub type InfoHash = [u8; 20];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

const METHODS: [(&str, Method); 4] = [
    ("ping", Method::Ping),
    ("find_node", Method::FindNode),
    ("get_peers", Method::GetPeers),
    ("announce_peer", Method::AnnouncePeer),
];

impl Method {
    pub fn name(&self) -> &'static str {
        METHODS
            .iter()
            .find(|(_, m)| m == self)
            .map(|(name, _)| *name)
            .unwrap_or_default()
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        METHODS
            .iter()
            .find(|(n, _)| n.as_bytes() == name)
            .map(|(_, m)| *m)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

impl Query {
    pub fn method(&self) -> Method {
        match self {
            Query::Ping => Method::Ping,
            Query::FindNode { .. } => Method::FindNode,
            Query::GetPeers { .. } => Method::GetPeers,
            Query::AnnouncePeer { .. } => Method::AnnouncePeer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<NodeInfo>,
    },
    GetPeers {
        id: NodeId,
        token: Bytes,
        nodes: Option<Vec<NodeInfo>>,
        peers: Option<Vec<SocketAddr>>,
    },
    AnnouncePeer {
        id: NodeId,
    },
}

impl Response {
    /// The responding node's id.
    pub fn id(&self) -> NodeId {
        match self {
            Response::Ping { id }
            | Response::FindNode { id, .. }
            | Response::GetPeers { id, .. }
            | Response::AnnouncePeer { id } => *id,
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Response::Ping { .. } => Method::Ping,
            Response::FindNode { .. } => Method::FindNode,
            Response::GetPeers { .. } => Method::GetPeers,
            Response::AnnouncePeer { .. } => Method::AnnouncePeer,
        }
    }
}

/// The `e` payload of a KRPC error message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("krpc error {code}: {message}")]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

impl KrpcError {
    pub const GENERIC: i64 = 201;
    pub const SERVER: i64 = 202;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(Self::PROTOCOL, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query { sender: NodeId, query: Query },
    Response(Response),
    Error(KrpcError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcMessage {
    pub transaction_id: TransactionId,
    pub body: Body,
}

impl KrpcMessage {
    pub fn query(transaction_id: TransactionId, sender: NodeId, query: Query) -> Self {
        Self {
            transaction_id,
            body: Body::Query { sender, query },
        }
    }

    pub fn response(transaction_id: TransactionId, response: Response) -> Self {
        Self {
            transaction_id,
            body: Body::Response(response),
        }
    }

    pub fn error(transaction_id: TransactionId, error: KrpcError) -> Self {
        Self {
            transaction_id,
            body: Body::Error(error),
        }
    }

    /// Decodes a datagram.
    ///
    /// `expected_method` maps a response's transaction id to the method of
    /// the query it answers; `None` fails with
    /// [`DhtError::TransactionMismatch`]. It is only consulted for responses.
    pub fn decode<F>(data: &[u8], expected_method: F) -> Result<Self, DhtError>
    where
        F: FnOnce(&[u8]) -> Option<Method>,
    {
        let value = decode(data)?;
        let transaction_id = value.require_bytes(b"t")?.clone();

        let body = match value.require_bytes(b"y")?.as_ref() {
            b"q" => Self::decode_query(&value)?,
            b"r" => {
                let method =
                    expected_method(transaction_id.as_ref()).ok_or(DhtError::TransactionMismatch)?;
                Body::Response(Self::decode_response(method, value.require_dict(b"r")?)?)
            }
            b"e" => Body::Error(Self::decode_error(&value)?),
            other => {
                return Err(DhtError::Decoding(format!(
                    "unknown message type {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }

    fn decode_query(value: &Value) -> Result<Body, DhtError> {
        let name = value.require_bytes(b"q")?;
        let method = Method::from_name(name).ok_or_else(|| {
            DhtError::Decoding(format!("unknown query {:?}", String::from_utf8_lossy(name)))
        })?;

        let args = value.require_dict(b"a")?;
        let sender = id_field(args, b"id")?;

        let query = match method {
            Method::Ping => Query::Ping,
            Method::FindNode => Query::FindNode {
                target: id_field(args, b"target")?,
            },
            Method::GetPeers => Query::GetPeers {
                info_hash: id_field(args, b"info_hash")?.0,
            },
            Method::AnnouncePeer => {
                let port = args.require_int(b"port")?;
                let port = u16::try_from(port)
                    .map_err(|_| DhtError::Decoding(format!("port {} out of range", port)))?;

                Query::AnnouncePeer {
                    info_hash: id_field(args, b"info_hash")?.0,
                    port,
                    token: args.require_bytes(b"token")?.clone(),
                    implied_port: args.optional_int(b"implied_port")? == Some(1),
                }
            }
        };

        Ok(Body::Query { sender, query })
    }

    fn decode_response(method: Method, ret: &Value) -> Result<Response, DhtError> {
        let id = id_field(ret, b"id")?;

        let response = match method {
            Method::Ping => Response::Ping { id },
            Method::AnnouncePeer => Response::AnnouncePeer { id },
            Method::FindNode => Response::FindNode {
                id,
                nodes: compact::unpack_nodes(ret.require_bytes(b"nodes")?)?,
            },
            Method::GetPeers => {
                let nodes = ret
                    .optional_bytes(b"nodes")?
                    .map(|data| compact::unpack_nodes(data))
                    .transpose()?;

                let peers = ret
                    .optional_list(b"values")?
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| {
                                let data = v.as_bytes().ok_or_else(|| {
                                    DhtError::Decoding("peer value is not a string".into())
                                })?;
                                compact::unpack_peer(data)
                            })
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .transpose()?;

                Response::GetPeers {
                    id,
                    token: ret.require_bytes(b"token")?.clone(),
                    nodes,
                    peers,
                }
            }
        };

        Ok(response)
    }

    fn decode_error(value: &Value) -> Result<KrpcError, DhtError> {
        let list = value.require_list(b"e")?;

        match list {
            [code, message, ..] => {
                let code = code
                    .as_integer()
                    .ok_or_else(|| DhtError::Decoding("error code is not an integer".into()))?;
                let message = message
                    .as_bytes()
                    .ok_or_else(|| DhtError::Decoding("error message is not a string".into()))?;
                Ok(KrpcError::new(code, String::from_utf8_lossy(message)))
            }
            _ => Err(DhtError::Decoding("error list too short".into())),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let t = Value::Bytes(self.transaction_id.clone());

        let dict = match &self.body {
            Body::Query { sender, query } => Value::dict([
                ("t", t),
                ("y", Value::string("q")),
                ("q", Value::string(query.method().name())),
                ("a", Self::encode_args(sender, query)),
            ]),
            Body::Response(response) => Value::dict([
                ("t", t),
                ("y", Value::string("r")),
                ("r", Self::encode_return(response)),
            ]),
            Body::Error(error) => Value::dict([
                ("t", t),
                ("y", Value::string("e")),
                (
                    "e",
                    Value::List(vec![Value::Integer(error.code), Value::string(&error.message)]),
                ),
            ]),
        };

        encode(&dict)
    }

    fn encode_args(sender: &NodeId, query: &Query) -> Value {
        let id = ("id", Value::bytes(sender.as_bytes()));

        match query {
            Query::Ping => Value::dict([id]),
            Query::FindNode { target } => {
                Value::dict([id, ("target", Value::bytes(target.as_bytes()))])
            }
            Query::GetPeers { info_hash } => {
                Value::dict([id, ("info_hash", Value::bytes(info_hash))])
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                let mut args = vec![
                    id,
                    ("info_hash", Value::bytes(info_hash)),
                    ("port", Value::Integer(i64::from(*port))),
                    ("token", Value::Bytes(token.clone())),
                ];
                if *implied_port {
                    args.push(("implied_port", Value::Integer(1)));
                }
                Value::dict(args)
            }
        }
    }

    fn encode_return(response: &Response) -> Value {
        let id = ("id", Value::bytes(response.id().as_bytes()));

        match response {
            Response::Ping { .. } | Response::AnnouncePeer { .. } => Value::dict([id]),
            Response::FindNode { nodes, .. } => {
                Value::dict([id, ("nodes", Value::Bytes(compact::pack_nodes(nodes)))])
            }
            Response::GetPeers {
                token,
                nodes,
                peers,
                ..
            } => {
                let mut ret = vec![id, ("token", Value::Bytes(token.clone()))];
                if let Some(nodes) = nodes {
                    ret.push(("nodes", Value::Bytes(compact::pack_nodes(nodes))));
                }
                if let Some(peers) = peers {
                    let values = peers
                        .iter()
                        .filter_map(compact::pack_peer)
                        .map(Value::Bytes)
                        .collect();
                    ret.push(("values", Value::List(values)));
                }
                Value::dict(ret)
            }
        }
    }
}

fn id_field(dict: &Value, key: &[u8]) -> Result<NodeId, DhtError> {
    NodeId::from_bytes(dict.require_bytes(key)?).map_err(|_| {
        DhtError::Decoding(format!(
            "{} must be 20 bytes",
            String::from_utf8_lossy(key)
        ))
    })
}
