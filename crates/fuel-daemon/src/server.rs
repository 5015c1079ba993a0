//! Unix socket server for daemon clients.
//!
//! Each connection runs its own task that reads newline-delimited commands
//! and writes replies and, once attached, broadcast events. Commands are
//! handed to the runner through an mpsc channel; the runner answers through
//! [`ClientRegistry`].

use crate::error::DaemonError;
use crate::events::EventBus;
use fuel_ipc::{decode, encode, IpcMessage, Payload, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long connections get to flush after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub type ClientId = u64;

/// A command received from a client.
#[derive(Debug, Clone)]
pub struct InboundCommand {
    pub client_id: ClientId,
    pub message: IpcMessage,
}

/// Instructions from the runner to one connection.
#[derive(Debug)]
enum Directive {
    Send(IpcMessage),
    /// Write `initial`, then forward broadcasts with ids above `after`.
    Attach {
        initial: Vec<IpcMessage>,
        after: u64,
    },
    Detach,
}

/// Handles to every connected client.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Directive>>>>,
    next_id: Arc<AtomicU64>,
}

impl ClientRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, mpsc::UnboundedSender<Directive>>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<Directive>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    fn remove(&self, id: ClientId) {
        self.lock().remove(&id);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn direct(&self, id: ClientId, directive: Directive) -> bool {
        match self.lock().get(&id) {
            Some(tx) => tx.send(directive).is_ok(),
            None => false,
        }
    }

    /// Send a message to one client. False if it has gone away.
    pub fn reply(&self, id: ClientId, message: IpcMessage) -> bool {
        self.direct(id, Directive::Send(message))
    }

    /// Add a client to the broadcast set after sending it `initial`.
    pub fn attach(&self, id: ClientId, initial: Vec<IpcMessage>, after: u64) -> bool {
        self.direct(id, Directive::Attach { initial, after })
    }

    /// Remove a client from the broadcast set; the connection stays open.
    pub fn detach(&self, id: ClientId) -> bool {
        self.direct(id, Directive::Detach)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Listening side of the daemon socket.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    bus: EventBus,
    commands: mpsc::Sender<InboundCommand>,
    clients: ClientRegistry,
}

impl IpcServer {
    /// Bind `socket_path`, replacing a stale socket file left by a dead daemon.
    pub async fn bind(
        socket_path: impl Into<PathBuf>,
        bus: EventBus,
        commands: mpsc::Sender<InboundCommand>,
    ) -> Result<Self, DaemonError> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if socket_path.exists() {
            if UnixStream::connect(&socket_path).await.is_ok() {
                return Err(DaemonError::AlreadyRunning(socket_path));
            }
            debug!(path = %socket_path.display(), "Removing stale socket");
            tokio::fs::remove_file(&socket_path).await?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|source| DaemonError::Bind {
            path: socket_path.clone(),
            source,
        })?;
        restrict_permissions(&socket_path)?;
        info!(path = %socket_path.display(), "IPC server listening");

        Ok(Self {
            listener,
            socket_path,
            bus,
            commands,
            clients: ClientRegistry::default(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn clients(&self) -> ClientRegistry {
        self.clients.clone()
    }

    /// Accept connections until `shutdown` fires, then let them drain.
    pub async fn serve(self, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let (client_id, directives) = self.clients.register();
                            info!(client_id, "Client connected");
                            connections.spawn(handle_connection(
                                stream,
                                client_id,
                                directives,
                                self.bus.clone(),
                                self.commands.clone(),
                                self.clients.clone(),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => warn!(error = %e, "Accept error"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // Dropping the senders ends each connection once its queue is written.
        self.clients.clear();
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Connections did not drain in time");
            connections.abort_all();
        }

        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await {
            debug!(error = %e, "Socket file already gone");
        }
        info!("IPC server stopped");
    }
}

fn restrict_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

struct Connection {
    writer: tokio::net::unix::OwnedWriteHalf,
    bus: EventBus,
    attached: bool,
    last_forwarded: u64,
}

impl Connection {
    async fn write(&mut self, message: &IpcMessage) -> std::io::Result<()> {
        let line = encode(message).map_err(std::io::Error::other)?;
        self.writer.write_all(line.as_bytes()).await
    }

    async fn forward(&mut self, event: IpcMessage) -> std::io::Result<()> {
        let id = event.event_id.unwrap_or(0);
        if !self.attached || id <= self.last_forwarded {
            return Ok(());
        }
        self.last_forwarded = id;
        self.write(&event).await
    }

    async fn apply(&mut self, directive: Directive) -> std::io::Result<()> {
        match directive {
            Directive::Send(message) => self.write(&message).await,
            Directive::Attach { initial, after } => {
                for message in &initial {
                    self.write(message).await?;
                }
                self.attached = true;
                self.last_forwarded = after;
                // Catch up on anything published while the snapshot was built.
                for event in self.bus.replay_after(after) {
                    self.forward(event).await?;
                }
                Ok(())
            }
            Directive::Detach => {
                self.attached = false;
                Ok(())
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    client_id: ClientId,
    mut directives: mpsc::UnboundedReceiver<Directive>,
    bus: EventBus,
    commands: mpsc::Sender<InboundCommand>,
    clients: ClientRegistry,
    shutdown: CancellationToken,
) {
    let (read_half, writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    // Bytes of the line being read; survives select! cancelling the read.
    let mut buf = Vec::new();
    let mut events = BroadcastStream::new(bus.subscribe());
    let mut conn = Connection {
        writer,
        bus: bus.clone(),
        attached: false,
        last_forwarded: 0,
    };

    let hello = bus.reply(
        Payload::Hello {
            version: PROTOCOL_VERSION.to_string(),
        },
        None,
    );
    if conn.write(&hello).await.is_err() {
        clients.remove(client_id);
        return;
    }

    let mut events_open = true;
    loop {
        let result = tokio::select! {
            read = reader.read_until(b'\n', &mut buf), if !shutdown.is_cancelled() => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let result = match std::str::from_utf8(&buf) {
                            Ok(line) => {
                                handle_line(line, client_id, &bus, &commands, &mut conn).await
                            }
                            Err(_) => {
                                debug!(client_id, "Non UTF-8 line");
                                let reply = bus.reply(
                                    Payload::error("message is not valid UTF-8"),
                                    None,
                                );
                                conn.write(&reply).await
                            }
                        };
                        buf.clear();
                        result
                    }
                    Err(e) => {
                        debug!(client_id, error = %e, "Read error");
                        break;
                    }
                }
            }
            directive = directives.recv() => {
                match directive {
                    Some(directive) => conn.apply(directive).await,
                    // Registry dropped us: shutting down.
                    None => break,
                }
            }
            event = events.next(), if events_open => {
                match event {
                    Some(Ok(event)) => conn.forward(event).await,
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        warn!(client_id, missed, "Client lagged behind event stream");
                        Ok(())
                    }
                    None => {
                        events_open = false;
                        Ok(())
                    }
                }
            }
        };
        if let Err(e) = result {
            debug!(client_id, error = %e, "Write failed, dropping client");
            break;
        }
    }

    // Flush anything the runner queued before the registry let go.
    while let Ok(directive) = directives.try_recv() {
        if conn.apply(directive).await.is_err() {
            break;
        }
    }
    let _ = conn.writer.shutdown().await;
    clients.remove(client_id);
    info!(client_id, "Client disconnected");
}

async fn handle_line(
    line: &str,
    client_id: ClientId,
    bus: &EventBus,
    commands: &mpsc::Sender<InboundCommand>,
    conn: &mut Connection,
) -> std::io::Result<()> {
    if line.trim().is_empty() {
        return Ok(());
    }
    let message = decode(line, bus.instance_id());

    if let Payload::Error { message: reason } = &message.payload {
        debug!(client_id, reason = %reason, "Protocol error");
        return conn.write(&message).await;
    }
    if !message.payload.is_command() {
        let reply = bus.reply(
            Payload::error(format!(
                "`{}` is an event and cannot be sent to the daemon",
                message.message_type()
            )),
            message.request_id.clone(),
        );
        return conn.write(&reply).await;
    }

    debug!(client_id, command = %message.message_type(), "Command received");
    if commands
        .send(InboundCommand { client_id, message })
        .await
        .is_err()
    {
        let reply = bus.reply(Payload::error("daemon is shutting down"), None);
        return conn.write(&reply).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuel_ipc::{IpcClient, StatusLevel};

    async fn start() -> (
        tempfile::TempDir,
        PathBuf,
        EventBus,
        mpsc::Receiver<InboundCommand>,
        ClientRegistry,
        CancellationToken,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let bus = EventBus::new("test-instance");
        let (tx, rx) = mpsc::channel(16);
        let server = IpcServer::bind(&path, bus.clone(), tx).await.unwrap();
        let clients = server.clients();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));
        (dir, path, bus, rx, clients, shutdown)
    }

    #[tokio::test]
    async fn test_hello_on_connect() {
        let (_dir, path, _bus, _rx, _clients, shutdown) = start().await;
        let mut client = IpcClient::connect(&path).await.unwrap();
        let hello = client.next_message().await.unwrap().unwrap();
        assert!(matches!(hello.payload, Payload::Hello { .. }));
        assert_eq!(hello.instance_id, "test-instance");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_garbage_gets_error_and_connection_survives() {
        let (_dir, path, _bus, mut rx, _clients, shutdown) = start().await;
        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let _hello = lines.next_line().await.unwrap().unwrap();

        write_half.write_all(b"{not json\n").await.unwrap();
        let reply = decode(&lines.next_line().await.unwrap().unwrap(), "");
        assert!(matches!(reply.payload, Payload::Error { .. }));

        write_half.write_all(b"{\"type\":\"pause\",\"request_id\":\"r1\"}\n").await.unwrap();
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.message.payload, Payload::Pause);
        assert_eq!(inbound.message.request_id.as_deref(), Some("r1"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_utf8_gets_error_and_connection_survives() {
        let (_dir, path, _bus, mut rx, _clients, shutdown) = start().await;
        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let _hello = lines.next_line().await.unwrap().unwrap();

        write_half.write_all(&[0xff, 0xfe, b'{', b'\n']).await.unwrap();
        let reply = decode(&lines.next_line().await.unwrap().unwrap(), "");
        match reply.payload {
            Payload::Error { message } => assert!(message.contains("UTF-8")),
            other => panic!("expected error, got {:?}", other),
        }

        write_half.write_all(b"{\"type\":\"pause\"}\n").await.unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.message.payload, Payload::Pause);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_events_from_clients_are_rejected() {
        let (_dir, path, _bus, _rx, _clients, shutdown) = start().await;
        let mut client = IpcClient::connect(&path).await.unwrap();
        let err = client
            .request(Payload::Hello { version: "1".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is an event"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_only_attached_clients_receive_broadcasts() {
        let (_dir, path, bus, mut rx, clients, shutdown) = start().await;

        let mut watcher = IpcClient::connect(&path).await.unwrap();
        let mut bystander = IpcClient::connect(&path).await.unwrap();
        watcher.next_message().await.unwrap();
        bystander.next_message().await.unwrap();

        watcher.send(Payload::Attach { last_event_id: None }).await.unwrap();
        let inbound = rx.recv().await.unwrap();
        let ack = bus.reply(Payload::status_line(StatusLevel::Info, "attached"), None);
        assert!(clients.attach(inbound.client_id, vec![ack], bus.last_event_id()));
        let first = watcher.next_message().await.unwrap().unwrap();
        assert!(matches!(first.payload, Payload::StatusLine { .. }));

        bus.publish(Payload::status_line(StatusLevel::Info, "broadcast"));
        let event = watcher.next_message().await.unwrap().unwrap();
        assert_eq!(event.event_id, Some(1));

        // The bystander only gets direct replies.
        bystander.send(Payload::RequestSnapshot).await.unwrap();
        let inbound = rx.recv().await.unwrap();
        clients.reply(
            inbound.client_id,
            bus.reply(Payload::error("no snapshot here"), inbound.message.request_id),
        );
        let reply = bystander.next_message().await.unwrap().unwrap();
        assert!(matches!(reply.payload, Payload::Error { .. }));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_second_daemon_refuses_live_socket() {
        let (_dir, path, _bus, _rx, _clients, shutdown) = start().await;
        let (tx, _rx2) = mpsc::channel(1);
        let err = IpcServer::bind(&path, EventBus::new("other"), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let (tx, _rx) = mpsc::channel(1);
        let server = IpcServer::bind(&path, EventBus::new("i"), tx).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));
        assert!(path.exists());
        shutdown.cancel();
        handle.await.unwrap();
        assert!(!path.exists());
    }
}
