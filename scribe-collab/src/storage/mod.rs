//! Persistence seam for document content.
//!
//! The editing core never talks to a database directly; it goes through
//! [`DocumentApi`], the same three calls a project/file HTTP API exposes:
//!
//! ```text
//! load_document(project, file)        -> content
//! save_document(project, file, text)  -> ok | error
//! create_file(project, path, text)    -> file id
//! ```
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`] — in-process map for tests and embedded setups
//! - [`DocumentStore`] — RocksDB, LZ4-compressed content + bincode metadata

pub mod memory;
pub mod rocks;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{DocumentId, ProjectId};

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

/// One file as listed by [`DocumentApi::list_files`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: DocumentId,
    pub path: String,
    /// Content size in bytes.
    pub size: u64,
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Document not found: {project}/{file}")]
    NotFound { project: ProjectId, file: DocumentId },
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(project: &ProjectId, file: &DocumentId) -> Self {
        StoreError::NotFound {
            project: project.clone(),
            file: file.clone(),
        }
    }
}

/// Durable storage for document content.
pub trait DocumentApi: Send + Sync + 'static {
    /// Fetch the authoritative content of a file.
    fn load_document(
        &self,
        project: &ProjectId,
        file: &DocumentId,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;

    /// Overwrite the content of an existing file.
    fn save_document(
        &self,
        project: &ProjectId,
        file: &DocumentId,
        content: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Create a new file at `path` and return its id.
    fn create_file(
        &self,
        project: &ProjectId,
        path: &str,
        content: &str,
    ) -> impl Future<Output = Result<DocumentId, StoreError>> + Send;

    /// List the files of a project, ordered by path.
    fn list_files(
        &self,
        project: &ProjectId,
    ) -> impl Future<Output = Result<Vec<FileEntry>, StoreError>> + Send;
}

/// Paths are relative, `/`-separated and non-empty.
pub(crate) fn validate_path(path: &str) -> Result<(), StoreError> {
    let invalid = path.trim().is_empty()
        || path.starts_with('/')
        || path.contains('\0')
        || path.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if invalid {
        Err(StoreError::InvalidPath(path.to_string()))
    } else {
        Ok(())
    }
}
