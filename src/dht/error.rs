use crate::bencode::BencodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed krpc message: {0}")]
    Decoding(String),

    #[error("no pending transaction for response")]
    TransactionMismatch,

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("query timed out")]
    Timeout,

    #[error("remote error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("too many pending queries")]
    RateLimited,

    #[error("dht is shut down")]
    Shutdown,

    #[error("bootstrap failed: no node responded")]
    BootstrapFailed,

    #[error("no bootstrap node could be resolved")]
    NoBootstrapNodes,
}

impl DhtError {
    /// True for failures that count against the queried node's liveness.
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            DhtError::Timeout
                | DhtError::Protocol { .. }
                | DhtError::Decoding(_)
        )
    }
}

impl From<BencodeError> for DhtError {
    fn from(err: BencodeError) -> Self {
        DhtError::Decoding(err.to_string())
    }
}
