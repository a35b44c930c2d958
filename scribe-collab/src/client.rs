//! Client side of the relay connection.
//!
//! A [`Connection`] is one live WebSocket session. It is opened explicitly
//! at session start and handed to whoever needs it; there is no process-wide
//! socket. From it you get:
//! - a [`ChannelClient`] per document, for outbound join/leave/sync/op
//! - one inbound [`ChannelEvent`] stream, fed by a reader task
//!
//! ```text
//! ChannelClient ──► outgoing mpsc ──► writer task ──► WebSocket
//! ChannelEvent  ◄── events mpsc   ◄── reader task ◄── WebSocket
//! ```

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::diff::Operation;
use crate::protocol::{CollabEvent, ConnectionId, DocumentId, ProtocolError};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Capacity of the outgoing and inbound channels
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// Transport state as seen by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Inbound events, already translated from wire frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A remote operation to apply to the local buffer
    Operation { room_id: DocumentId, op: Operation },
    /// Another member asks for our snapshot
    SyncRequested {
        room_id: DocumentId,
        from: Option<ConnectionId>,
    },
    /// A full snapshot to replace the local buffer with
    SyncSnapshot { room_id: DocumentId, content: String },
    /// The transport is gone
    Disconnected,
}

impl ChannelEvent {
    /// Translate a wire event. Membership events are relay-bound and yield
    /// nothing.
    pub fn from_wire(event: CollabEvent) -> Option<Self> {
        match event {
            CollabEvent::Op { room_id, op } => Some(ChannelEvent::Operation { room_id, op }),
            CollabEvent::SyncRequest { room_id, from } => {
                Some(ChannelEvent::SyncRequested { room_id, from })
            }
            CollabEvent::Sync { room_id, content, .. } => {
                Some(ChannelEvent::SyncSnapshot { room_id, content })
            }
            CollabEvent::Join { .. } | CollabEvent::Leave { .. } => None,
        }
    }
}

/// One transport session to the relay.
pub struct Connection {
    outgoing: mpsc::Sender<CollabEvent>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
}

impl Connection {
    /// Connect to the relay and spawn the reader and writer tasks.
    pub async fn open(config: &ClientConfig) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(config.server_url.as_str())
            .await
            .map_err(|e| ProtocolError::ConnectFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to relay at {}", config.server_url);

        let capacity = config.channel_capacity.max(1);
        let (out_tx, mut out_rx) = mpsc::channel::<CollabEvent>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(capacity);

        // Writer: ends once every sender (connection + channel clients) is gone.
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match event.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Dropping unencodable {}: {e}", event.name());
                        continue;
                    }
                };
                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                    log::warn!("Send failed, closing writer: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader: frames arrive in transport order and are forwarded as-is.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match CollabEvent::decode(text.as_str()) {
                        Ok(event) => {
                            let Some(event) = ChannelEvent::from_wire(event) else {
                                continue;
                            };
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("Relay connection error: {e}");
                        break;
                    }
                    Ok(_) => {}
                }
            }
            log::info!("Relay connection closed");
            let _ = event_tx.send(ChannelEvent::Disconnected).await;
        });

        Ok(Self {
            outgoing: out_tx,
            events: Some(event_rx),
        })
    }

    /// Wrap an existing transport: `outgoing` carries events to the relay,
    /// `events` delivers inbound ones.
    pub fn from_parts(
        outgoing: mpsc::Sender<CollabEvent>,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            outgoing,
            events: Some(events),
        }
    }

    /// Take the inbound event stream (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events.take()
    }

    /// A client bound to one document room on this connection.
    pub fn channel(&self, room_id: DocumentId) -> ChannelClient {
        ChannelClient {
            room_id,
            outgoing: self.outgoing.clone(),
        }
    }

    /// Whether the writer side has shut down.
    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

/// Outbound half of the change channel for one document.
///
/// Sends never wait on peers: they complete once the event is queued for
/// the writer task.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    room_id: DocumentId,
    outgoing: mpsc::Sender<CollabEvent>,
}

impl ChannelClient {
    pub fn room_id(&self) -> &DocumentId {
        &self.room_id
    }

    /// Announce membership in the room. Repeating it is harmless.
    pub async fn join(&self) -> Result<(), ProtocolError> {
        self.send(CollabEvent::join(self.room_id.clone())).await
    }

    /// Announce departure from the room.
    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(CollabEvent::leave(self.room_id.clone())).await
    }

    /// Ask current members for their snapshot.
    pub async fn request_sync(&self) -> Result<(), ProtocolError> {
        self.send(CollabEvent::sync_request(self.room_id.clone())).await
    }

    /// Send a locally derived operation. Local state is not touched.
    pub async fn send_operation(&self, op: Operation) -> Result<(), ProtocolError> {
        self.send(CollabEvent::op(self.room_id.clone(), op)).await
    }

    /// Answer a sync request with our snapshot, addressed to the requester
    /// when known.
    pub async fn send_snapshot(
        &self,
        content: impl Into<String>,
        to: Option<ConnectionId>,
    ) -> Result<(), ProtocolError> {
        self.send(CollabEvent::sync(self.room_id.clone(), content, to)).await
    }

    async fn send(&self, event: CollabEvent) -> Result<(), ProtocolError> {
        self.outgoing
            .send(event)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
