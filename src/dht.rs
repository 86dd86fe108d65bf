//! Distributed Hash Table (BEP-5)
//!
//! The Kademlia-based DHT BitTorrent uses for trackerless peer discovery:
//! a 160-bit id space under the XOR metric, a bucketed routing table with
//! liveness-driven eviction, KRPC over UDP, and iterative parallel lookups.
//!
//! [`Dht`] is the entry point. The pieces it is built from are public so
//! they can be driven on their own, e.g. over a [`MemoryNetwork`].

mod compact;
mod config;
mod error;
mod lookup;
mod maintenance;
mod message;
mod node;
mod routing;
mod server;
mod service;
mod socket;
mod transport;

pub use compact::{pack_nodes, unpack_nodes};
pub use config::{DhtConfig, DhtContext};
pub use error::DhtError;
pub use lookup::{FindNode, GetPeers, GetPeersOutcome, Lookup, LookupOutcome, LookupStrategy};
pub use maintenance::Maintenance;
pub use message::{Body, InfoHash, KrpcError, KrpcMessage, Method, Query, Response, TransactionId};
pub use node::{Distance, Node, NodeId, NodeInfo, NodeState, Prefix};
pub use routing::{InsertOutcome, LivenessProbe, RoutingTable};
pub use server::QueryServer;
pub use service::{Dht, PeerDiscoveryListener};
pub use socket::{DatagramSocket, MemoryNetwork, MemorySocket};
pub use transport::{QueryHandler, Transport};

#[cfg(test)]
mod tests;
