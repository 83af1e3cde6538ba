//! WebSocket front-end for the sync engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ── server copy ── per-client shadows
//! Client B ──┘              │
//!                           ├── SaveCoalescer ── Adapter (storage)
//!                           │
//!                ┌──────────┴───────────┐
//!                ▼                      ▼
//!            Client A               Client B
//!        (reply frames)      (update broadcasts)
//! ```
//!
//! Each connection runs one task that reads frames off the socket, feeds
//! them to the [`SessionRouter`], and writes reply frames back. Room
//! broadcasts arrive via per-room forwarder tasks spawned on join. A
//! connection that drops has its client state torn down for every room it
//! joined.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::adapter::{Adapter, MemoryAdapter};
use crate::diff::DiffOptions;
use crate::protocol::{commands, Frame};
use crate::session::SessionRouter;
use crate::storage::{RocksAdapter, StorageConfig};
use crate::transport::{ChannelTransport, Connection};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    router: Arc<SessionRouter>,
    transport: Arc<ChannelTransport>,
    stats: Arc<AtomicStats>,
}

impl SyncServer {
    /// Create a server from its configuration.
    ///
    /// When `storage_path` is set, rooms persist through a [`RocksAdapter`]
    /// opened at that path; otherwise an in-memory adapter is used.
    pub fn new(config: ServerConfig) -> Self {
        let adapter: Arc<dyn Adapter> = match &config.storage_path {
            Some(path) => Arc::new(
                RocksAdapter::open(StorageConfig::new(path, Value::Object(Default::default())))
                    .expect("failed to open document store"),
            ),
            None => Arc::new(MemoryAdapter::default()),
        };
        Self::with_adapter(config, adapter)
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Create with an injected adapter and the default diff options.
    pub fn with_adapter(config: ServerConfig, adapter: Arc<dyn Adapter>) -> Self {
        Self::with_diff_options(config, adapter, DiffOptions::default())
    }

    /// Create a server with a custom diff configuration (object hash).
    pub fn with_diff_options(
        config: ServerConfig,
        adapter: Arc<dyn Adapter>,
        options: DiffOptions,
    ) -> Self {
        let transport = Arc::new(ChannelTransport::new(config.broadcast_capacity));
        let router = Arc::new(SessionRouter::new(adapter, transport.clone(), options));
        Self {
            config,
            router,
            transport,
            stats: Arc::new(AtomicStats::default()),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop forever; call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let router = self.router.clone();
            let transport = self.transport.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, router, transport, stats).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        router: Arc<SessionRouter>,
        transport: Arc<ChannelTransport>,
        stats: Arc<AtomicStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(WsConnection {
            id: Uuid::new_v4().to_string(),
            user_id: std::sync::RwLock::new(None),
            joined: std::sync::Mutex::new(Vec::new()),
            out_tx,
            transport,
        });
        log::info!("connection {} established", connection.id);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                            match Frame::decode(text.as_str()) {
                                Ok(frame) => {
                                    Self::dispatch(&router, &connection, frame).await;
                                }
                                Err(e) => {
                                    log::warn!("undecodable frame from {}: {e}", connection.id);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {} closed", connection.id);
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("websocket error on {}: {e}", connection.id);
                            break;
                        }
                        _ => {}
                    }
                }

                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            let encoded = frame.encode()?;
                            ws_sender.send(Message::Text(encoded.into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Tear down client state in every joined room.
        let joined = connection.joined.lock().expect("connection lock").clone();
        for room in joined {
            router.handle_leave(&connection.id, &room).await;
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Route one decoded frame to the session router.
    async fn dispatch(router: &SessionRouter, connection: &Arc<WsConnection>, frame: Frame) {
        match frame.event.as_str() {
            commands::JOIN => {
                let payload = match frame.join_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("bad join from {}: {e}", connection.id);
                        return;
                    }
                };
                if let Some(user_id) = payload.user_id {
                    *connection.user_id.write().expect("connection lock") = Some(user_id);
                }
                match router.handle_join(connection.as_ref(), &payload.room).await {
                    Ok(document) => {
                        connection.send(Frame::reply(commands::JOIN, frame.seq, document));
                    }
                    Err(e) => {
                        log::error!("join failed for {}: {e}", connection.id);
                        connection.send(Frame::event(commands::ERROR, Value::from(e.to_string())));
                    }
                }
            }
            commands::SYNC_WITH_SERVER => {
                let message = match frame.edit_message() {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("bad edit message from {}: {e}", connection.id);
                        return;
                    }
                };
                if let Some(reply) = router.handle_sync(connection.as_ref(), message).await {
                    match serde_json::to_value(&reply) {
                        Ok(data) => connection.send(Frame::reply(
                            commands::SYNC_WITH_SERVER,
                            frame.seq,
                            data,
                        )),
                        Err(e) => log::error!("unencodable reply: {e}"),
                    }
                }
            }
            other => {
                log::debug!("unhandled event {other:?} from {}", connection.id);
            }
        }
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.router.store().room_count(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The session router driving this server.
    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }
}

/// A connection backed by a live WebSocket.
struct WsConnection {
    id: String,
    user_id: std::sync::RwLock<Option<String>>,
    joined: std::sync::Mutex<Vec<String>>,
    out_tx: mpsc::UnboundedSender<Frame>,
    transport: Arc<ChannelTransport>,
}

impl WsConnection {
    fn send(&self, frame: Frame) {
        // Failure means the writer half is gone; the read loop will notice.
        let _ = self.out_tx.send(frame);
    }
}

impl Connection for WsConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn user_id(&self) -> String {
        self.user_id
            .read()
            .expect("connection lock")
            .clone()
            .unwrap_or_else(|| "anonymous".to_string())
    }

    fn join(&self, room: &str) {
        self.joined
            .lock()
            .expect("connection lock")
            .push(room.to_string());

        // Forward this room's broadcasts into the connection's writer.
        let mut rx = self.transport.subscribe(room);
        let out = self.out_tx.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if out.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("connection {id} lagged by {n} broadcasts");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn emit(&self, event: &str, payload: Value) {
        self.send(Frame::event(event, payload));
    }
}
