//! Fatal daemon errors.

use crate::config::ConfigError;
use crate::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop the daemon from starting or running.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to bind IPC socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Another daemon is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
