//! Error types for cluster transport.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to connect to peer {peer}: {reason}")]
    Connect { peer: String, reason: String },

    #[error("http error talking to {peer}: {reason}")]
    Http { peer: String, reason: String },

    #[error("peer {peer} answered {status}")]
    Status { peer: String, status: u16 },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("peer {peer} did not answer within {timeout:?}")]
    Timeout { peer: String, timeout: Duration },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}
