//! In-memory document store.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::{validate_path, DocumentApi, FileEntry, StoreError};
use crate::protocol::{DocumentId, ProjectId};

#[derive(Debug, Clone)]
struct StoredFile {
    path: String,
    content: String,
}

/// [`DocumentApi`] backed by a map. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RwLock<BTreeMap<(ProjectId, DocumentId), StoredFile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file with a known id.
    pub async fn insert(
        &self,
        project: ProjectId,
        file: DocumentId,
        path: impl Into<String>,
        content: impl Into<String>,
    ) {
        self.files.write().await.insert(
            (project, file),
            StoredFile {
                path: path.into(),
                content: content.into(),
            },
        );
    }
}

impl DocumentApi for MemoryStore {
    async fn load_document(
        &self,
        project: &ProjectId,
        file: &DocumentId,
    ) -> Result<String, StoreError> {
        self.files
            .read()
            .await
            .get(&(project.clone(), file.clone()))
            .map(|stored| stored.content.clone())
            .ok_or_else(|| StoreError::not_found(project, file))
    }

    async fn save_document(
        &self,
        project: &ProjectId,
        file: &DocumentId,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut files = self.files.write().await;
        let stored = files
            .get_mut(&(project.clone(), file.clone()))
            .ok_or_else(|| StoreError::not_found(project, file))?;
        stored.content = content.to_string();
        Ok(())
    }

    async fn create_file(
        &self,
        project: &ProjectId,
        path: &str,
        content: &str,
    ) -> Result<DocumentId, StoreError> {
        validate_path(path)?;
        let file = DocumentId::new(Uuid::new_v4().to_string());
        self.insert(project.clone(), file.clone(), path, content).await;
        Ok(file)
    }

    async fn list_files(&self, project: &ProjectId) -> Result<Vec<FileEntry>, StoreError> {
        let files = self.files.read().await;
        let mut entries: Vec<FileEntry> = files
            .iter()
            .filter(|((p, _), _)| p == project)
            .map(|((_, file_id), stored)| FileEntry {
                file_id: file_id.clone(),
                path: stored.path.clone(),
                size: stored.content.len() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}
