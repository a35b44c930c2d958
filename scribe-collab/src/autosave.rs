//! Debounced persistence of local edits.
//!
//! ```text
//!          edit                      edit (deadline re-armed)
//! Idle ─────────► Pending{deadline} ─────────┐
//!  ▲                   │  ◄─────────────────┘
//!  └── save(latest) ◄──┘ deadline elapsed
//! ```
//!
//! Only the newest snapshot is ever written. A failed save is reported and
//! left alone; the next edit schedules another attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::protocol::{DocumentId, ProjectId};
use crate::storage::DocumentApi;

#[derive(Debug, Clone)]
pub struct AutosaveConfig {
    /// Time without edits before a save fires
    pub quiet_period: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(1000),
        }
    }
}

/// Where saves go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveTarget {
    /// A file that already exists in the store
    Existing { project: ProjectId, file: DocumentId },
    /// A file created on first save
    New { project: ProjectId, path: String },
}

/// Save feedback for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SaveStatus {
    #[default]
    Idle,
    Saving,
    Saved,
    Failed(String),
}

enum State {
    Idle,
    Pending { deadline: Instant, content: String },
}

impl State {
    fn pending(content: String, quiet_period: Duration) -> Self {
        State::Pending {
            deadline: Instant::now() + quiet_period,
            content,
        }
    }
}

/// Cheap handle to a running scheduler.
#[derive(Debug, Clone)]
pub struct AutosaveHandle {
    edits: mpsc::UnboundedSender<String>,
    status: watch::Receiver<SaveStatus>,
    target: watch::Receiver<SaveTarget>,
}

impl AutosaveHandle {
    /// Record a local change. Returns `false` if the scheduler has stopped.
    pub fn notify(&self, content: impl Into<String>) -> bool {
        self.edits.send(content.into()).is_ok()
    }

    pub fn status(&self) -> SaveStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
        self.status.clone()
    }

    /// Current target; switches to `Existing` once a new file is created.
    pub fn target(&self) -> SaveTarget {
        self.target.borrow().clone()
    }
}

/// Start a scheduler task. It runs until every handle is dropped, flushing
/// a pending snapshot on the way out.
pub fn spawn<S: DocumentApi>(
    store: Arc<S>,
    target: SaveTarget,
    config: AutosaveConfig,
) -> AutosaveHandle {
    let (edits_tx, edits_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SaveStatus::Idle);
    let (target_tx, target_rx) = watch::channel(target.clone());

    let saver = Saver {
        store,
        target,
        status: status_tx,
        target_tx,
    };
    tokio::spawn(run(saver, edits_rx, config.quiet_period));

    AutosaveHandle {
        edits: edits_tx,
        status: status_rx,
        target: target_rx,
    }
}

async fn run<S: DocumentApi>(
    mut saver: Saver<S>,
    mut edits: mpsc::UnboundedReceiver<String>,
    quiet_period: Duration,
) {
    let mut state = State::Idle;
    loop {
        state = match state {
            State::Idle => match edits.recv().await {
                Some(content) => State::pending(content, quiet_period),
                None => break,
            },
            State::Pending { deadline, content } => {
                tokio::select! {
                    next = edits.recv() => match next {
                        Some(newer) => State::pending(newer, quiet_period),
                        None => {
                            saver.save(&content).await;
                            break;
                        }
                    },
                    _ = time::sleep_until(deadline) => {
                        saver.save(&content).await;
                        State::Idle
                    }
                }
            }
        };
    }
    log::debug!("Autosave stopped");
}

struct Saver<S> {
    store: Arc<S>,
    target: SaveTarget,
    status: watch::Sender<SaveStatus>,
    target_tx: watch::Sender<SaveTarget>,
}

impl<S: DocumentApi> Saver<S> {
    async fn save(&mut self, content: &str) {
        self.status.send_replace(SaveStatus::Saving);

        let result = match self.target.clone() {
            SaveTarget::Existing { project, file } => {
                self.store.save_document(&project, &file, content).await
            }
            SaveTarget::New { project, path } => {
                match self.store.create_file(&project, &path, content).await {
                    Ok(file) => {
                        log::info!("Created {path} as {file} in project {project}");
                        self.target = SaveTarget::Existing { project, file };
                        self.target_tx.send_replace(self.target.clone());
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(()) => {
                log::debug!("Saved {} chars", content.chars().count());
                self.status.send_replace(SaveStatus::Saved);
            }
            Err(e) => {
                log::error!("Autosave failed: {e}");
                self.status.send_replace(SaveStatus::Failed(e.to_string()));
            }
        }
    }
}
