//! rbit-dht - the BitTorrent Mainline DHT
//!
//! A standalone implementation of the Kademlia-based distributed hash table
//! BitTorrent clients use to find peers without a tracker.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 routing table, KRPC transport, lookups and maintenance
//! - [`constants`] - Protocol constants and defaults

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{Dht, DhtConfig, DhtError, Node, NodeId, NodeInfo, RoutingTable};
