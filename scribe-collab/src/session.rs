//! One participant editing one document.
//!
//! The buffer is owned by a single actor task. Local edits (via
//! [`SessionHandle`]) and inbound channel events are handled one at a time
//! in that task, so they never interleave mid-update.
//!
//! ```text
//! SessionHandle ── Command ──►┌──────────────┐── ops/sync ──► ChannelClient
//!                             │ EditorSession│
//! Connection ── ChannelEvent ►└──────┬───────┘── snapshot ──► AutosaveHandle
//!                                    ▼
//!                          watch: content, status
//! ```

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::autosave::AutosaveHandle;
use crate::buffer::DocumentBuffer;
use crate::client::{ChannelClient, ChannelEvent, Connection, ConnectionState};
use crate::diff::Operation;
use crate::protocol::{ConnectionId, DocumentId, ProjectId, ProtocolError};
use crate::storage::{DocumentApi, StoreError};
use crate::sync::{self, SyncCoordinator};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session closed")]
    Closed,
    #[error("Connection events already taken by another session")]
    EventsTaken,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the editor shows next to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    /// A remote operation did not fit the buffer; a resync has been requested
    pub desynchronized: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Connected,
            desynchronized: false,
        }
    }
}

enum Command {
    Edit {
        content: String,
        reply: oneshot::Sender<()>,
    },
    RequestSync {
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Reattach {
        channel: ChannelClient,
        events: mpsc::Receiver<ChannelEvent>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Close {
        reply: oneshot::Sender<String>,
    },
}

/// Handle to a running session. Cloning shares the same session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    document: DocumentId,
    commands: mpsc::Sender<Command>,
    content: watch::Receiver<String>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    /// Apply a local edit: the buffer takes `content`, the difference goes
    /// to the room and the snapshot to autosave.
    pub async fn edit(&self, content: impl Into<String>) -> Result<(), SessionError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Edit {
            content: content.into(),
            reply,
        })
        .await?;
        done.await.map_err(|_| SessionError::Closed)
    }

    /// Ask the room for a fresh snapshot.
    pub async fn request_sync(&self) -> Result<(), SessionError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::RequestSync { reply }).await?;
        Ok(done.await.map_err(|_| SessionError::Closed)??)
    }

    /// Continue on a new connection after a transport failure: rejoin the
    /// room and resync.
    pub async fn reattach(&self, connection: &mut Connection) -> Result<(), SessionError> {
        let events = connection.take_events().ok_or(SessionError::EventsTaken)?;
        let channel = connection.channel(self.document.clone());
        let (reply, done) = oneshot::channel();
        self.send(Command::Reattach {
            channel,
            events,
            reply,
        })
        .await?;
        Ok(done.await.map_err(|_| SessionError::Closed)??)
    }

    pub fn content(&self) -> String {
        self.content.borrow().clone()
    }

    pub fn subscribe_content(&self) -> watch::Receiver<String> {
        self.content.clone()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Leave the room and stop the session, returning the final content.
    pub async fn close(&self) -> Result<String, SessionError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Close { reply }).await?;
        done.await.map_err(|_| SessionError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// The actor owning a document buffer.
pub struct EditorSession {
    channel: ChannelClient,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    buffer: DocumentBuffer,
    sync: SyncCoordinator,
    autosave: Option<AutosaveHandle>,
    content_tx: watch::Sender<String>,
    status_tx: watch::Sender<SessionStatus>,
}

impl EditorSession {
    /// Load `document` from the store, join its room on `connection` and
    /// ask peers for a fresher snapshot.
    pub async fn open<S: DocumentApi>(
        store: &S,
        project: &ProjectId,
        document: &DocumentId,
        connection: &mut Connection,
        autosave: Option<AutosaveHandle>,
    ) -> Result<SessionHandle, SessionError> {
        let buffer = sync::load_initial(store, project, document).await?;
        let events = connection.take_events().ok_or(SessionError::EventsTaken)?;
        let channel = connection.channel(document.clone());
        Self::start(buffer, channel, events, autosave).await
    }

    /// Start a session from an already loaded buffer.
    pub async fn start(
        buffer: DocumentBuffer,
        channel: ChannelClient,
        events: mpsc::Receiver<ChannelEvent>,
        autosave: Option<AutosaveHandle>,
    ) -> Result<SessionHandle, SessionError> {
        let document = channel.room_id().clone();
        let mut sync = SyncCoordinator::new();
        channel.join().await?;
        sync.request(&channel).await?;
        log::info!("Session opened for {document}");

        let (content_tx, content_rx) = watch::channel(buffer.content().to_string());
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (commands_tx, commands_rx) = mpsc::channel(64);

        let session = Self {
            channel,
            events: Some(events),
            buffer,
            sync,
            autosave,
            content_tx,
            status_tx,
        };
        tokio::spawn(session.run(commands_rx));

        Ok(SessionHandle {
            document,
            commands: commands_tx,
            content: content_rx,
            status: status_rx,
        })
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.leave().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                event = async {
                    match self.events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Some(ChannelEvent::Disconnected) | None => self.mark_disconnected(),
                    Some(event) => self.handle_event(event).await,
                },
            }
        }
        log::info!("Session closed for {}", self.channel.room_id());
    }

    /// Returns `false` once the session should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Edit { content, reply } => {
                self.local_edit(content).await;
                let _ = reply.send(());
            }
            Command::RequestSync { reply } => {
                let result = self.sync.request(&self.channel).await;
                if result.is_err() {
                    self.mark_disconnected();
                }
                let _ = reply.send(result);
            }
            Command::Reattach {
                channel,
                events,
                reply,
            } => {
                self.channel = channel;
                self.events = Some(events);
                let result = self.rejoin().await;
                if result.is_ok() {
                    self.set_status(|s| s.connection = ConnectionState::Connected);
                }
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.leave().await;
                let _ = reply.send(self.buffer.content().to_string());
                return false;
            }
        }
        true
    }

    async fn local_edit(&mut self, content: String) {
        let ops = self.buffer.edit(content);
        if ops.is_empty() {
            return;
        }
        self.publish_content();
        if let Some(autosave) = &self.autosave {
            if !autosave.notify(self.buffer.content()) {
                log::warn!("Autosave for {} has stopped", self.channel.room_id());
            }
        }
        for op in ops {
            if let Err(e) = self.channel.send_operation(op).await {
                log::warn!("Operation not sent for {}: {e}", self.channel.room_id());
                self.mark_disconnected();
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Operation { room_id, op } if &room_id == self.channel.room_id() => {
                self.remote_operation(op).await;
            }
            ChannelEvent::SyncRequested { room_id, from } if &room_id == self.channel.room_id() => {
                self.answer_sync(from).await;
            }
            ChannelEvent::SyncSnapshot { room_id, content } if &room_id == self.channel.room_id() => {
                if !self.sync.accept(&mut self.buffer, content) {
                    log::debug!("Applied unsolicited snapshot on {}", room_id);
                }
                self.publish_content();
                self.set_status(|s| s.desynchronized = false);
            }
            other => log::debug!("Ignoring event for another room: {other:?}"),
        }
    }

    async fn remote_operation(&mut self, op: Operation) {
        let applied = self.buffer.apply(&op);
        self.publish_content();
        if applied.is_clamped() {
            log::warn!(
                "Clamped {op:?} on {}; requesting a full sync",
                self.channel.room_id()
            );
            self.set_status(|s| s.desynchronized = true);
            if self.sync.request(&self.channel).await.is_err() {
                self.mark_disconnected();
            }
        }
    }

    async fn answer_sync(&mut self, from: Option<ConnectionId>) {
        if let Err(e) = self.sync.respond(&self.channel, &self.buffer, from).await {
            log::warn!("Could not answer sync on {}: {e}", self.channel.room_id());
            self.mark_disconnected();
        }
    }

    async fn rejoin(&mut self) -> Result<(), ProtocolError> {
        self.channel.join().await?;
        self.sync.request(&self.channel).await?;
        log::info!("Rejoined {}", self.channel.room_id());
        Ok(())
    }

    async fn leave(&mut self) {
        if let Err(e) = self.channel.leave().await {
            log::debug!("Leave not delivered for {}: {e}", self.channel.room_id());
        }
    }

    fn mark_disconnected(&mut self) {
        self.events = None;
        if self.status_tx.borrow().connection == ConnectionState::Connected {
            log::warn!("Disconnected from relay while editing {}", self.channel.room_id());
        }
        self.set_status(|s| s.connection = ConnectionState::Disconnected);
    }

    fn publish_content(&self) {
        self.content_tx.send_replace(self.buffer.content().to_string());
    }

    fn set_status(&self, update: impl FnOnce(&mut SessionStatus)) {
        self.status_tx.send_if_modified(|status| {
            let before = *status;
            update(status);
            before != *status
        });
    }
}
