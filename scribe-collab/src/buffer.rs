//! The local copy of a document's text.

use crate::diff::{self, Applied, Operation};

/// Text buffer plus a flag recording whether it may have drifted from peers.
///
/// The flag is raised when a remote operation had to be clamped and cleared
/// when a full snapshot replaces the content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentBuffer {
    content: String,
    desynchronized: bool,
}

impl DocumentBuffer {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            desynchronized: false,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Replace the content wholesale.
    pub fn replace(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.desynchronized = false;
    }

    /// Set a locally edited content and return the operations peers need to
    /// reach it.
    pub fn edit(&mut self, content: impl Into<String>) -> Vec<Operation> {
        let content = content.into();
        let ops = diff::diff(&self.content, &content);
        self.content = content;
        ops
    }

    /// Apply a remote operation.
    pub fn apply(&mut self, op: &Operation) -> Applied {
        let applied = op.apply(&mut self.content);
        if applied.is_clamped() {
            self.desynchronized = true;
        }
        applied
    }
}
