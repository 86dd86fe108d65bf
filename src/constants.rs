//! Protocol constants and tuning parameters.
//!
//! Values follow [BEP-5] where it gives one and the defaults of mainstream
//! clients (libtorrent, Transmission) where it doesn't.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use std::time::Duration;

// ============================================================================
// Identifier space
// ============================================================================

/// Length of a node id or info hash in bytes.
pub const ID_LEN: usize = 20;

/// Number of bits in a node id.
pub const ID_BITS: usize = ID_LEN * 8;

/// One routing-table bucket per possible shared-prefix length.
pub const NUM_BUCKETS: usize = ID_BITS;

// ============================================================================
// Routing
// ============================================================================

/// Bucket capacity.
pub const K: usize = 8;

/// Lookup fan-out per round.
pub const ALPHA: usize = 3;

/// A node that responded (or queried us) within this window is good.
pub const NODE_GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Consecutive failed queries after which a node is bad.
pub const MAX_NODE_FAILURES: u8 = 2;

/// Buckets untouched for this long get refreshed.
pub const BUCKET_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// Transport
// ============================================================================

/// Deadline for a single KRPC query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outstanding queries before `send_query` refuses new ones.
pub const MAX_PENDING_QUERIES: usize = 1024;

/// Length of generated transaction ids.
pub const TRANSACTION_ID_LEN: usize = 2;

/// Large enough for any UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

// ============================================================================
// Lookups and maintenance
// ============================================================================

/// Upper bound on lookup rounds.
pub const MAX_LOOKUP_ROUNDS: usize = 20;

/// Concurrent bucket refreshes issued by bootstrap.
pub const REFRESH_CONCURRENCY: usize = 8;

/// How often stale buckets are checked.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often registered info hashes are looked up again.
pub const PEER_LOOKUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// Query server
// ============================================================================

/// Token secrets rotate this often; the previous one stays valid.
pub const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Bytes of the SHA-1 digest handed out as a token.
pub const TOKEN_LEN: usize = 8;

/// Announced peers expire after this long.
pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Announced peers kept per info hash.
pub const MAX_PEERS_PER_TORRENT: usize = 1000;

/// Info hashes the peer store tracks at once.
pub const MAX_STORED_INFO_HASHES: usize = 2000;

/// Peers returned in a single get_peers response.
pub const MAX_PEERS_PER_RESPONSE: usize = 50;

// ============================================================================
// Network
// ============================================================================

/// Default DHT listen port.
pub const DEFAULT_PORT: u16 = 6881;

/// Well-known routers used when no bootstrap node is configured.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];
