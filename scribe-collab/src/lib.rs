//! # scribe-collab — Real-time collaborative text editing sync
//!
//! Several participants edit the same text document at once. Each keeps a
//! local buffer; local edits are diffed into operations and relayed to the
//! other members of the document's room, which apply them on receipt.
//! Late joiners load from the store and then ask the room for a snapshot.
//! Edits are persisted after a quiet period.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ EditorSession │ ◄────────────────► │ RelayServer │
//! │ (per user)    │     JSON frames    │ (central)   │
//! └──────┬────────┘                    └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌───────────────┐                   ┌───────────────┐
//! │ Autosave      │                   │ RoomManager   │
//! │ (debounced)   │                   │ doc → members │
//! └──────┬────────┘                   └──────┬────────┘
//!        ▼                                   │
//! ┌───────────────┐                   ┌──────┴────────┐
//! │ DocumentApi   │                   │ BroadcastGroup│
//! │ (durable)     │                   │ (fan-out)     │
//! └───────────────┘                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`diff`] — Prefix/suffix diff and operation application
//! - [`protocol`] — Identifiers and the JSON wire events
//! - [`broadcast`] — Per-room fan-out excluding the sender
//! - [`server`] — WebSocket relay
//! - [`client`] — Relay connection and per-document channel client
//! - [`buffer`] — Local document buffer
//! - [`sync`] — Initial load and snapshot exchange
//! - [`session`] — Editor session actor
//! - [`autosave`] — Debounced persistence
//! - [`storage`] — Persistence seam, in-memory and RocksDB stores
//!
//! Operations are not transformed against concurrent ones: two participants
//! editing the same region at once may diverge until the next full sync.

pub mod diff;
pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod buffer;
pub mod sync;
pub mod session;
pub mod autosave;
pub mod storage;

// Re-exports for convenience
pub use diff::{Applied, Operation};
pub use protocol::{CollabEvent, ConnectionId, DocumentId, ProjectId, ProtocolError};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame, RoomManager};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::{ChannelClient, ChannelEvent, ClientConfig, Connection, ConnectionState};
pub use buffer::DocumentBuffer;
pub use sync::SyncCoordinator;
pub use session::{EditorSession, SessionError, SessionHandle, SessionStatus};
pub use autosave::{AutosaveConfig, AutosaveHandle, SaveStatus, SaveTarget};
pub use storage::{
    DocumentApi, DocumentMetadata, DocumentStore, FileEntry, MemoryStore, StoreConfig,
    StoreError,
};
