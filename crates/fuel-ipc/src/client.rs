//! Async client for the daemon socket.

use crate::codec::{decode, encode, generate_request_id};
use crate::message::{IpcMessage, Payload};
use crate::ProtocolError;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

/// One connection to a running daemon.
pub struct IpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl IpcClient {
    /// Connect to the daemon listening on `socket_path`.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let (read_half, writer) = stream.into_split();
        debug!(socket = %socket_path.as_ref().display(), "Connected to daemon");
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        })
    }

    /// Send a command and return the request id it was tagged with.
    pub async fn send(&mut self, payload: Payload) -> Result<String, ProtocolError> {
        let request_id = generate_request_id();
        let message = IpcMessage::new(payload, "").with_request_id(Some(request_id.clone()));
        self.writer.write_all(encode(&message)?.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(request_id)
    }

    /// Read the next message, `None` once the daemon hangs up.
    pub async fn next_message(&mut self) -> Result<Option<IpcMessage>, ProtocolError> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(decode(&line, ""))),
                None => return Ok(None),
            }
        }
    }

    /// Send a command and wait for the reply carrying its request id.
    ///
    /// Broadcast events that arrive first are skipped. An `error` reply is
    /// surfaced as [`ProtocolError::Remote`].
    pub async fn request(&mut self, payload: Payload) -> Result<IpcMessage, ProtocolError> {
        let request_id = self.send(payload).await?;
        loop {
            let message = self
                .next_message()
                .await?
                .ok_or(ProtocolError::ConnectionClosed)?;
            if message.request_id.as_deref() != Some(request_id.as_str()) {
                continue;
            }
            if let Payload::Error { message } = message.payload {
                return Err(ProtocolError::Remote(message));
            }
            return Ok(message);
        }
    }
}
