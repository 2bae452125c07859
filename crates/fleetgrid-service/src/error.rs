//! Error types for service lifecycle operations.

use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use fleetgrid_state::StateError;

/// Result type alias for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown service: {0}")]
    UnknownService(Uuid),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("service name {0} is already taken")]
    NameTaken(String),

    #[error("service {0} has no command")]
    EmptyCommand(String),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("inclusion {url} failed: {reason}")]
    Inclusion { url: String, reason: String },

    #[error("path escapes the service directory: {0}")]
    UnsafePath(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closure factory wrapping an `io::Error` with the path it concerns.
pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ServiceError + '_ {
    move |source| ServiceError::Io {
        path: path.to_path_buf(),
        source,
    }
}
