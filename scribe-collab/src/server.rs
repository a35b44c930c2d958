//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Client B
//!            ├── Room (document id) ─┤
//! Client C ──┘   BroadcastGroup      └── Client D
//! ```
//!
//! The relay holds no document state. It tracks membership, forwards
//! operations and sync traffic to the other members of a room, and cleans
//! up membership when a connection leaves or drops. Each connection runs in
//! its own task; rooms only contend on their own broadcast group.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, RoomFrame, RoomManager};
use crate::protocol::{CollabEvent, ConnectionId, DocumentId};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Heartbeat periods a peer may stay silent before it is dropped.
const MISSED_HEARTBEATS: u32 = 3;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames a slow member may lag behind before losing them
    pub broadcast_capacity: usize,
    /// Interval between WebSocket pings to each client
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
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
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

/// Lock-free counters so that connection tasks never contend on stats.
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_messages: AtomicU64,
}

impl AtomicServerStats {
    fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            rejected_messages: AtomicU64::new(0),
        }
    }

    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn record_frame(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected_messages.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, active_rooms: usize) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            rejected_messages: self.rejected_messages.load(Ordering::Relaxed),
            active_rooms,
        }
    }
}

/// When a peer last sent anything, pongs included.
struct Liveness {
    last_seen: Instant,
    timeout: Duration,
}

impl Liveness {
    fn new(period: Duration) -> Self {
        Self {
            last_seen: Instant::now(),
            timeout: period * MISSED_HEARTBEATS,
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn is_expired(&self) -> bool {
        self.last_seen.elapsed() > self.timeout
    }
}

/// The room a connection currently belongs to.
struct Membership {
    room_id: DocumentId,
    group: Arc<BroadcastGroup>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<AtomicServerStats>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            room_manager,
            stats: Arc::new(AtomicServerStats::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let room_manager = self.room_manager.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, room_manager, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to cleanup.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        room_manager: Arc<RoomManager>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let conn = ConnectionId::new();
        log::info!("Connection {conn} established from {addr}");

        stats.connection_opened();

        let mut membership: Option<Membership> = None;
        let result = Self::connection_loop(
            ws_stream,
            conn,
            &mut membership,
            &room_manager,
            &stats,
            &config,
        )
        .await;

        // Disconnect runs the same removal as an explicit leave.
        if let Some(m) = membership.take() {
            room_manager.leave(&m.room_id, &conn).await;
            log::info!("Connection {conn} dropped from room {}", m.room_id);
        }

        stats.connection_closed();
        log::info!("Connection {conn} from {addr} closed");

        result
    }

    async fn connection_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        conn: ConnectionId,
        membership: &mut Option<Membership>,
        room_manager: &RoomManager,
        stats: &AtomicServerStats,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut room_rx: Option<broadcast::Receiver<Arc<RoomFrame>>> = None;

        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let mut liveness = Liveness::new(period);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    if matches!(msg, Some(Ok(_))) {
                        liveness.touch();
                    }
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.record_frame(text.as_str().len());
                            match CollabEvent::decode(text.as_str()) {
                                Ok(event) => {
                                    Self::dispatch(conn, event, membership, &mut room_rx, room_manager).await?;
                                }
                                Err(e) => {
                                    stats.record_rejected();
                                    log::warn!("Ignoring undecodable frame from {conn}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {conn}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                frame = async {
                    match room_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if frame.is_for(conn) {
                                ws_sender.send(Message::Text(frame.payload.to_string().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {conn} lagged by {n} frames; they are lost");
                            if let Some(m) = membership.as_ref() {
                                m.group.record_dropped(n);
                            }
                        }
                        Err(RecvError::Closed) => room_rx = None,
                    }
                }

                _ = heartbeat.tick() => {
                    if liveness.is_expired() {
                        log::warn!("Connection {conn} missed {MISSED_HEARTBEATS} heartbeats; dropping it");
                        break;
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    /// Apply one inbound event to membership and routing.
    async fn dispatch(
        conn: ConnectionId,
        event: CollabEvent,
        membership: &mut Option<Membership>,
        room_rx: &mut Option<broadcast::Receiver<Arc<RoomFrame>>>,
        room_manager: &RoomManager,
    ) -> Result<(), BoxError> {
        match event {
            CollabEvent::Join { room_id } => {
                if membership.as_ref().is_some_and(|m| m.room_id == room_id) {
                    log::debug!("Connection {conn} already in room {room_id}");
                    return Ok(());
                }
                // One room per connection: joining implies leaving the old one.
                if let Some(previous) = membership.take() {
                    *room_rx = None;
                    room_manager.leave(&previous.room_id, &conn).await;
                    log::info!("Connection {conn} left room {} to switch rooms", previous.room_id);
                }
                let (group, rx) = room_manager.join(&room_id, conn).await;
                *room_rx = Some(rx);
                log::info!(
                    "Connection {conn} joined room {room_id} ({} members)",
                    group.member_count().await
                );
                *membership = Some(Membership { room_id, group });
            }

            CollabEvent::Leave { room_id } => {
                if membership.as_ref().is_some_and(|m| m.room_id == room_id) {
                    *membership = None;
                    *room_rx = None;
                    room_manager.leave(&room_id, &conn).await;
                    log::info!("Connection {conn} left room {room_id}");
                } else {
                    log::debug!("Connection {conn} left room {room_id} it never joined");
                }
            }

            event => {
                let Some(m) = membership.as_ref().filter(|m| &m.room_id == event.room_id()) else {
                    log::debug!(
                        "Ignoring {} from {conn} for unjoined room {}",
                        event.name(),
                        event.room_id()
                    );
                    return Ok(());
                };
                match event {
                    CollabEvent::SyncRequest { room_id, .. } => {
                        let forwarded = CollabEvent::SyncRequest {
                            room_id,
                            from: Some(conn),
                        };
                        let receivers = m.group.broadcast(conn, &forwarded)?;
                        log::debug!("Sync request from {conn} fanned out to {} receivers", receivers.saturating_sub(1));
                    }
                    CollabEvent::Sync {
                        room_id,
                        content,
                        to: Some(target),
                    } => {
                        m.group.send_to(conn, target, &CollabEvent::sync(room_id, content, None))?;
                    }
                    other => {
                        m.group.broadcast(conn, &other)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.snapshot(self.room_manager.room_count().await)
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}
