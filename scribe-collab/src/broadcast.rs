//! Room membership and fan-out to N-1 members.
//!
//! Each document room owns one tokio broadcast channel. Frames are encoded
//! once and shared behind an `Arc`; every member's receiver filters out
//! frames it originated and frames targeted at someone else.
//!
//! Delivery is best-effort: a member whose receiver falls more than
//! `capacity` frames behind loses the oldest ones (counted as dropped).
//! Nothing is queued for members that are not currently joined.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{CollabEvent, ConnectionId, DocumentId, ProtocolError};

/// One encoded event travelling through a room.
#[derive(Debug)]
pub struct RoomFrame {
    /// Connection that sent the event.
    pub origin: ConnectionId,
    /// Restrict delivery to a single member (targeted sync replies).
    pub target: Option<ConnectionId>,
    /// Pre-encoded JSON text frame.
    pub payload: Arc<str>,
}

impl RoomFrame {
    /// Whether `member` should receive this frame.
    pub fn is_for(&self, member: ConnectionId) -> bool {
        self.origin != member && self.target.map_or(true, |target| target == member)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters so that `broadcast()` never takes a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The broadcast group for a single document room.
pub struct BroadcastGroup {
    room_id: DocumentId,
    sender: broadcast::Sender<Arc<RoomFrame>>,
    members: RwLock<HashSet<ConnectionId>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow member may lag behind before it
    /// starts losing them.
    pub fn new(room_id: DocumentId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            room_id,
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a member and return its receiver.
    ///
    /// The receiver only sees frames sent after this call.
    pub async fn add_member(&self, member: ConnectionId) -> broadcast::Receiver<Arc<RoomFrame>> {
        let mut members = self.members.write().await;
        members.insert(member);
        self.sender.subscribe()
    }

    /// Remove a member. Returns whether it was present.
    pub async fn remove_member(&self, member: &ConnectionId) -> bool {
        self.members.write().await.remove(member)
    }

    /// Fan `event` out to every member except `origin`.
    ///
    /// Returns the number of live receivers the frame was handed to
    /// (the origin's own receiver included; it discards the frame).
    pub fn broadcast(&self, origin: ConnectionId, event: &CollabEvent) -> Result<usize, ProtocolError> {
        self.send_frame(origin, None, event)
    }

    /// Deliver `event` to `target` only.
    pub fn send_to(
        &self,
        origin: ConnectionId,
        target: ConnectionId,
        event: &CollabEvent,
    ) -> Result<usize, ProtocolError> {
        self.send_frame(origin, Some(target), event)
    }

    fn send_frame(
        &self,
        origin: ConnectionId,
        target: Option<ConnectionId>,
        event: &CollabEvent,
    ) -> Result<usize, ProtocolError> {
        let payload: Arc<str> = event.encode()?.into();
        let frame = Arc::new(RoomFrame {
            origin,
            target,
            payload,
        });
        // No receivers is not an error: the frame is simply lost.
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn room_id(&self) -> &DocumentId {
        &self.room_id
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, member: &ConnectionId) -> bool {
        self.members.read().await.contains(member)
    }

    pub async fn members(&self) -> Vec<ConnectionId> {
        self.members.read().await.iter().copied().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document ids to their broadcast groups.
///
/// Rooms are created by the first join and removed when the last member
/// leaves. Membership changes go through the map's write lock so a room is
/// never removed while someone is joining it; fan-out only touches the
/// room's own group.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add `member` to the room for `room_id`, creating the room if needed.
    pub async fn join(
        &self,
        room_id: &DocumentId,
        member: ConnectionId,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Arc<RoomFrame>>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                log::info!("Room {room_id} created");
                Arc::new(BroadcastGroup::new(room_id.clone(), self.default_capacity))
            })
            .clone();
        let rx = room.add_member(member).await;
        (room, rx)
    }

    /// Remove `member` from the room. Explicit leave and disconnect both end
    /// up here. Empty rooms are dropped. Returns whether it was a member.
    pub async fn leave(&self, room_id: &DocumentId, member: &ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id) else {
            return false;
        };
        let removed = room.remove_member(member).await;
        if room.member_count().await == 0 {
            rooms.remove(room_id);
            log::info!("Room {room_id} removed (empty)");
        }
        removed
    }

    /// Look up an existing room.
    pub async fn get(&self, room_id: &DocumentId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Current members of a room (empty if the room does not exist).
    pub async fn members(&self, room_id: &DocumentId) -> Vec<ConnectionId> {
        match self.get(room_id).await {
            Some(room) => room.members().await,
            None => Vec::new(),
        }
    }

    pub async fn is_member(&self, room_id: &DocumentId, member: &ConnectionId) -> bool {
        match self.get(room_id).await {
            Some(room) => room.has_member(member).await,
            None => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Operation;
    use tokio::sync::broadcast::error::TryRecvError;

    fn op_event(room: &str) -> CollabEvent {
        CollabEvent::op(room.into(), Operation::insert(0, "x"))
    }

    /// Drain frames addressed to `member`.
    fn received(rx: &mut broadcast::Receiver<Arc<RoomFrame>>, member: ConnectionId) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(frame) if frame.is_for(member) => out.push(frame.payload.to_string()),
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
        out
    }

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new("doc".into(), 16);
        let alice = ConnectionId::new();

        let _rx = group.add_member(alice).await;
        assert_eq!(group.member_count().await, 1);
        assert!(group.has_member(&alice).await);

        assert!(group.remove_member(&alice).await);
        assert!(!group.remove_member(&alice).await);
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let group = BroadcastGroup::new("doc".into(), 16);
        let (alice, bob, carol) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        let mut rx_a = group.add_member(alice).await;
        let mut rx_b = group.add_member(bob).await;
        let mut rx_c = group.add_member(carol).await;

        let count = group.broadcast(alice, &op_event("doc")).unwrap();
        assert_eq!(count, 3);

        assert!(received(&mut rx_a, alice).is_empty());
        assert_eq!(received(&mut rx_b, bob).len(), 1);
        assert_eq!(received(&mut rx_c, carol).len(), 1);
    }

    #[tokio::test]
    async fn test_send_to_reaches_only_target() {
        let group = BroadcastGroup::new("doc".into(), 16);
        let (alice, bob, carol) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        let mut rx_b = group.add_member(bob).await;
        let mut rx_c = group.add_member(carol).await;

        let reply = CollabEvent::sync("doc".into(), "snapshot", None);
        group.send_to(alice, bob, &reply).unwrap();

        assert_eq!(received(&mut rx_b, bob).len(), 1);
        assert!(received(&mut rx_c, carol).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_without_members_is_lost() {
        let group = BroadcastGroup::new("doc".into(), 16);
        let count = group.broadcast(ConnectionId::new(), &op_event("doc")).unwrap();
        assert_eq!(count, 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_late_member_gets_no_backlog() {
        let group = BroadcastGroup::new("doc".into(), 16);
        let alice = ConnectionId::new();
        let _rx_a = group.add_member(alice).await;
        group.broadcast(alice, &op_event("doc")).unwrap();

        let bob = ConnectionId::new();
        let mut rx_b = group.add_member(bob).await;
        assert!(received(&mut rx_b, bob).is_empty());
    }

    #[tokio::test]
    async fn test_lagging_member_loses_frames() {
        let group = BroadcastGroup::new("doc".into(), 2);
        let (alice, bob) = (ConnectionId::new(), ConnectionId::new());
        let mut rx_b = group.add_member(bob).await;

        for _ in 0..5 {
            group.broadcast(alice, &op_event("doc")).unwrap();
        }
        match rx_b.try_recv() {
            Err(TryRecvError::Lagged(n)) => {
                group.record_dropped(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(received(&mut rx_b, bob).len(), 2);
        assert_eq!(group.stats().await.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_manager_join_creates_room_once() {
        let manager = RoomManager::new(16);
        let doc: DocumentId = "doc".into();

        let (room1, _rx1) = manager.join(&doc, ConnectionId::new()).await;
        let (room2, _rx2) = manager.join(&doc, ConnectionId::new()).await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(manager.members(&doc).await.len(), 2);
        assert_eq!(room1.room_id(), &doc);
    }

    #[tokio::test]
    async fn test_manager_join_then_leave() {
        let manager = RoomManager::new(16);
        let doc: DocumentId = "doc".into();
        let alice = ConnectionId::new();

        let _ = manager.join(&doc, alice).await;
        assert!(manager.is_member(&doc, &alice).await);

        assert!(manager.leave(&doc, &alice).await);
        assert!(!manager.is_member(&doc, &alice).await);
        assert!(manager.members(&doc).await.is_empty());
        assert_eq!(manager.room_count().await, 0);

        // Leaving twice is harmless.
        assert!(!manager.leave(&doc, &alice).await);
    }

    #[tokio::test]
    async fn test_manager_room_survives_until_last_member() {
        let manager = RoomManager::new(16);
        let doc: DocumentId = "doc".into();
        let (alice, bob) = (ConnectionId::new(), ConnectionId::new());

        let _ = manager.join(&doc, alice).await;
        let _ = manager.join(&doc, bob).await;

        manager.leave(&doc, &alice).await;
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(manager.members(&doc).await, vec![bob]);

        manager.leave(&doc, &bob).await;
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_manager_rooms_isolated() {
        let manager = RoomManager::new(16);
        let (doc1, doc2): (DocumentId, DocumentId) = ("one".into(), "two".into());
        let (alice, bob) = (ConnectionId::new(), ConnectionId::new());

        let (room1, _rx_a) = manager.join(&doc1, alice).await;
        let (_room2, mut rx_b) = manager.join(&doc2, bob).await;

        room1.broadcast(alice, &op_event("one")).unwrap();
        assert!(received(&mut rx_b, bob).is_empty());

        assert_eq!(manager.room_count().await, 2);
        assert!(manager.is_member(&doc1, &alice).await);
        assert!(!manager.is_member(&doc2, &alice).await);
    }

    #[tokio::test]
    async fn test_capacity() {
        let group = BroadcastGroup::new("doc".into(), 32);
        assert_eq!(group.capacity(), 32);
    }
}
