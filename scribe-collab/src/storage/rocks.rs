//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — file content (LZ4 compressed)
//! - `metadata`  — file metadata (bincode: path, revision, sizes, timestamps)
//!
//! Keys are `<project id> 0x00 <file id>`, so all files of one project are
//! adjacent and can be listed with a forward scan from `<project id> 0x00`.
//!
//! The inherent methods block on RocksDB I/O. The [`DocumentApi`] methods run
//! them on tokio's blocking pool, so a store can be shared between tasks
//! without stalling the runtime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{validate_path, DocumentApi, FileEntry, StoreError};
use crate::protocol::{DocumentId, ProjectId};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Metadata stored alongside each file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub project_id: ProjectId,
    pub file_id: DocumentId,
    /// Project-relative path
    pub path: String,
    /// Incremented on every save; 0 right after creation
    pub revision: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(project_id: ProjectId, file_id: DocumentId, path: String) -> Self {
        let now = unix_now();
        Self {
            project_id,
            file_id,
            path,
            revision: 0,
            content_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }

    pub fn entry(&self) -> FileEntry {
        FileEntry {
            file_id: self.file_id.clone(),
            path: self.path.clone(),
            size: self.content_size,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed document store.
///
/// Clones share the same database.
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: Arc<StoreConfig>,
    /// Held across the metadata read-modify-write of a save.
    write_lock: Arc<Mutex<()>>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened document store at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Content is LZ4-compressed before it gets here.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Files ────────────────────────────────────────────────────────

    /// Create a file with a fresh id.
    pub fn create(
        &self,
        project: &ProjectId,
        path: &str,
        content: &str,
    ) -> Result<DocumentMetadata, StoreError> {
        validate_path(path)?;
        let file = DocumentId::new(Uuid::new_v4().to_string());
        let meta = DocumentMetadata::new(project.clone(), file, path.to_string());
        self.write_content(meta, content)
    }

    /// Overwrite the content of an existing file.
    ///
    /// Concurrent saves of the same file each get their own revision.
    pub fn put_content(
        &self,
        project: &ProjectId,
        file: &DocumentId,
        content: &str,
    ) -> Result<DocumentMetadata, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = self.load_metadata(project, file)?;
        meta.revision += 1;
        self.write_content(meta, content)
    }

    /// Load and decompress the content of a file.
    pub fn load_content(&self, project: &ProjectId, file: &DocumentId) -> Result<String, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let key = file_key(project, file)?;

        let compressed = self
            .db
            .get_cf(cf, &key)?
            .ok_or_else(|| StoreError::not_found(project, file))?;
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    pub fn load_metadata(
        &self,
        project: &ProjectId,
        file: &DocumentId,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let key = file_key(project, file)?;

        match self.db.get_cf(cf, &key)? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::not_found(project, file)),
        }
    }

    /// Metadata of every file in a project, in key order.
    pub fn project_files(&self, project: &ProjectId) -> Result<Vec<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let prefix = project_prefix(project)?;

        let mut files = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            files.push(DocumentMetadata::decode(&value)?);
        }
        Ok(files)
    }

    /// Delete a file's content and metadata.
    pub fn delete(&self, project: &ProjectId, file: &DocumentId) -> Result<(), StoreError> {
        let key = file_key(project, file)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, &key);
        batch.delete_cf(self.cf(CF_METADATA)?, &key);
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Atomic batch write of content + metadata.
    fn write_content(
        &self,
        mut meta: DocumentMetadata,
        content: &str,
    ) -> Result<DocumentMetadata, StoreError> {
        let key = file_key(&meta.project_id, &meta.file_id)?;
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());

        meta.content_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, &key, &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, &key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Run `f` against a clone of this store on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&DocumentStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

impl DocumentApi for DocumentStore {
    async fn load_document(
        &self,
        project: &ProjectId,
        file: &DocumentId,
    ) -> Result<String, StoreError> {
        let (project, file) = (project.clone(), file.clone());
        self.blocking(move |store| store.load_content(&project, &file))
            .await
    }

    async fn save_document(
        &self,
        project: &ProjectId,
        file: &DocumentId,
        content: &str,
    ) -> Result<(), StoreError> {
        let (project, file, content) = (project.clone(), file.clone(), content.to_string());
        let meta = self
            .blocking(move |store| store.put_content(&project, &file, &content))
            .await?;
        log::debug!(
            "Saved {}/{} rev {} ({} -> {} bytes)",
            meta.project_id,
            meta.file_id,
            meta.revision,
            meta.content_size,
            meta.compressed_size
        );
        Ok(())
    }

    async fn create_file(
        &self,
        project: &ProjectId,
        path: &str,
        content: &str,
    ) -> Result<DocumentId, StoreError> {
        let (project, path, content) = (project.clone(), path.to_string(), content.to_string());
        let meta = self
            .blocking(move |store| store.create(&project, &path, &content))
            .await?;
        log::info!("Created {}/{} at {}", meta.project_id, meta.file_id, meta.path);
        Ok(meta.file_id)
    }

    async fn list_files(&self, project: &ProjectId) -> Result<Vec<FileEntry>, StoreError> {
        let project = project.clone();
        let mut entries: Vec<FileEntry> = self
            .blocking(move |store| store.project_files(&project))
            .await?
            .iter()
            .map(DocumentMetadata::entry)
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

/// `<project> 0x00`; ids may not contain NUL.
fn project_prefix(project: &ProjectId) -> Result<Vec<u8>, StoreError> {
    if project.as_str().is_empty() || project.as_str().as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StoreError::InvalidKey(project.to_string()));
    }
    let mut key = Vec::with_capacity(project.as_str().len() + 1);
    key.extend_from_slice(project.as_str().as_bytes());
    key.push(KEY_SEPARATOR);
    Ok(key)
}

/// `<project> 0x00 <file>`.
fn file_key(project: &ProjectId, file: &DocumentId) -> Result<Vec<u8>, StoreError> {
    if file.as_str().is_empty() || file.as_str().as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StoreError::InvalidKey(file.to_string()));
    }
    let mut key = project_prefix(project)?;
    key.extend_from_slice(file.as_str().as_bytes());
    Ok(key)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
