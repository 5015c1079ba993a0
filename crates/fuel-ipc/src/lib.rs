//! Fuel IPC protocol.
//!
//! Every message is one JSON object on one line. The `type` field selects
//! the variant; `timestamp`, `instance_id`, and `request_id` form the
//! envelope shared by commands (client to daemon) and events (daemon to
//! clients).

pub mod client;
pub mod codec;
pub mod error;
pub mod message;

pub use client::IpcClient;
pub use codec::{decode, encode, generate_instance_id, generate_request_id};
pub use error::ProtocolError;
pub use message::{IpcMessage, MessageType, OutputStream, Payload, StatusLevel, StopMode};

/// Protocol version announced in `hello`.
pub const PROTOCOL_VERSION: &str = "1";

/// Per-project state directory.
pub const FUEL_DIR: &str = ".fuel";

/// Daemon socket file name inside [`FUEL_DIR`].
pub const SOCKET_FILE: &str = "agent.sock";

/// Socket a daemon for `project_dir` listens on.
pub fn default_socket_path(project_dir: &std::path::Path) -> std::path::PathBuf {
    project_dir.join(FUEL_DIR).join(SOCKET_FILE)
}
