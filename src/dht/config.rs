use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::node::NodeId;
use crate::constants;

/// Runtime configuration of a DHT node.
///
/// All fields default to the values in [`crate::constants`].
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Address the UDP socket binds to
    pub bind_addr: SocketAddr,
    /// Bucket capacity
    pub k: usize,
    /// Queries in flight per lookup round
    pub alpha: usize,
    /// Deadline of each individual query
    pub query_timeout: Duration,
    /// Hard cap on lookup rounds
    pub max_rounds: usize,
    /// Outstanding queries before new ones are refused
    pub max_pending: usize,
    /// Period of the stale-bucket check
    pub refresh_interval: Duration,
    /// A populated bucket unchanged for this long is refreshed
    pub bucket_stale_after: Duration,
    /// Concurrent refreshes during bootstrap
    pub refresh_concurrency: usize,
    /// Period of token secret rotation
    pub token_rotation_interval: Duration,
    /// Period of get_peers lookups for registered info hashes
    pub peer_lookup_interval: Duration,
    /// Host names or addresses used by `Dht::bootstrap`
    pub bootstrap_nodes: Vec<String>,
    /// Announced peers kept per info hash
    pub max_peers_per_torrent: usize,
    /// Info hashes the peer store tracks at once
    pub max_info_hashes: usize,
    /// Announced peers expire after this long
    pub peer_announce_lifetime: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, constants::DEFAULT_PORT)),
            k: constants::K,
            alpha: constants::ALPHA,
            query_timeout: constants::QUERY_TIMEOUT,
            max_rounds: constants::MAX_LOOKUP_ROUNDS,
            max_pending: constants::MAX_PENDING_QUERIES,
            refresh_interval: constants::REFRESH_INTERVAL,
            bucket_stale_after: constants::BUCKET_STALE_AFTER,
            refresh_concurrency: constants::REFRESH_CONCURRENCY,
            token_rotation_interval: constants::TOKEN_ROTATION_INTERVAL,
            peer_lookup_interval: constants::PEER_LOOKUP_INTERVAL,
            bootstrap_nodes: constants::BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_peers_per_torrent: constants::MAX_PEERS_PER_TORRENT,
            max_info_hashes: constants::MAX_STORED_INFO_HASHES,
            peer_announce_lifetime: constants::PEER_ANNOUNCE_LIFETIME,
        }
    }
}

impl DhtConfig {
    /// Creates a configuration listening on the given address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Replaces the bootstrap list; an empty list disables the public routers.
    pub fn with_bootstrap_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    /// Bounds the announced-peer store.
    pub fn with_peer_store_limits(mut self, max_info_hashes: usize, lifetime: Duration) -> Self {
        self.max_info_hashes = max_info_hashes.max(1);
        self.peer_announce_lifetime = lifetime;
        self
    }
}

/// Per-instance state every DHT component shares: our identity and the
/// configuration. Passed around explicitly so that several nodes can live
/// in one process.
#[derive(Debug, Clone)]
pub struct DhtContext {
    pub local_id: NodeId,
    pub config: DhtConfig,
}

impl DhtContext {
    /// A context with a freshly generated node id.
    pub fn new(config: DhtConfig) -> Self {
        Self::with_id(NodeId::generate(), config)
    }

    pub fn with_id(local_id: NodeId, config: DhtConfig) -> Self {
        Self { local_id, config }
    }
}
