//! Initial load and snapshot exchange for late joiners.
//!
//! ```text
//! open ──► load_document ──► join ──► sync:request ──► [peers answer]
//!                                                       last snapshot wins
//! ```
//!
//! With nobody else in the room the request goes unanswered and the loaded
//! content stands. Snapshots are never merged.

use crate::buffer::DocumentBuffer;
use crate::client::ChannelClient;
use crate::protocol::{ConnectionId, DocumentId, ProjectId, ProtocolError};
use crate::storage::{DocumentApi, StoreError};

/// Fetch the authoritative starting content from the store.
pub async fn load_initial<S: DocumentApi>(
    store: &S,
    project: &ProjectId,
    document: &DocumentId,
) -> Result<DocumentBuffer, StoreError> {
    let content = store.load_document(project, document).await?;
    log::debug!(
        "Loaded {} ({} chars) from project {}",
        document,
        content.chars().count(),
        project
    );
    Ok(DocumentBuffer::new(content))
}

/// Tracks our own sync requests and applies incoming snapshots.
#[derive(Debug, Default)]
pub struct SyncCoordinator {
    awaiting: bool,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the room for a snapshot.
    pub async fn request(&mut self, channel: &ChannelClient) -> Result<(), ProtocolError> {
        channel.request_sync().await?;
        self.awaiting = true;
        Ok(())
    }

    /// Answer a peer's request with our current content.
    pub async fn respond(
        &self,
        channel: &ChannelClient,
        buffer: &DocumentBuffer,
        requester: Option<ConnectionId>,
    ) -> Result<(), ProtocolError> {
        channel
            .send_snapshot(buffer.content(), requester)
            .await
    }

    /// Replace the buffer with a peer's snapshot. Applied unconditionally,
    /// in arrival order.
    ///
    /// Returns whether one of our requests was outstanding; later answers to
    /// the same request return `false`.
    pub fn accept(&mut self, buffer: &mut DocumentBuffer, content: String) -> bool {
        buffer.replace(content);
        std::mem::replace(&mut self.awaiting, false)
    }

    /// Whether a request is still unanswered.
    pub fn is_awaiting(&self) -> bool {
        self.awaiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Connection;
    use crate::protocol::CollabEvent;
    use crate::storage::MemoryStore;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_load_initial_from_store() {
        let store = MemoryStore::new();
        let project = ProjectId::new("p");
        let file = store.create_file(&project, "a.txt", "stored").await.unwrap();

        let buffer = load_initial(&store, &project, &file).await.unwrap();
        assert_eq!(buffer.content(), "stored");
        assert!(load_initial(&store, &project, &"missing".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_request_and_respond() {
        let (out_tx, mut wire) = mpsc::channel(8);
        let (_event_tx, event_rx) = mpsc::channel(8);
        let connection = Connection::from_parts(out_tx, event_rx);
        let channel = connection.channel("doc".into());

        let mut sync = SyncCoordinator::new();
        sync.request(&channel).await.unwrap();
        assert!(sync.is_awaiting());
        assert_eq!(wire.recv().await.unwrap(), CollabEvent::sync_request("doc".into()));

        let requester = ConnectionId::new();
        let buffer = DocumentBuffer::new("mine");
        sync.respond(&channel, &buffer, Some(requester)).await.unwrap();
        assert_eq!(
            wire.recv().await.unwrap(),
            CollabEvent::sync("doc".into(), "mine", Some(requester))
        );
    }

    #[test]
    fn test_last_snapshot_wins() {
        let mut sync = SyncCoordinator::new();
        let mut buffer = DocumentBuffer::new("loaded");

        // Two peers answer; both apply, only the first was outstanding.
        sync.awaiting = true;
        assert!(sync.accept(&mut buffer, "first".to_string()));
        assert!(!sync.accept(&mut buffer, "second".to_string()));

        assert_eq!(buffer.content(), "second");
        assert!(!sync.is_awaiting());
    }
}
