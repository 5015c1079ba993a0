//! Protocol and client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket I/O failed.
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The daemon closed the connection.
    #[error("Connection closed by daemon")]
    ConnectionClosed,

    /// The daemon answered with an `error` event.
    #[error("Daemon error: {0}")]
    Remote(String),
}
