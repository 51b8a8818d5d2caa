//! Shared registry for chunk/file/link operations
//!
//! `Chunk` and `File` both need each other (a chunk cascades to its owning
//! files, a file reads its chunks). Neither holds a reference to the other;
//! both take a `&Repository` and go through the metadata store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::content_store::{ContentStats, ContentStore};
use crate::db::{self, DbStats, MetadataDb};
use crate::error::StorageError;
use crate::locks::KeyedLocks;
use crate::reconcile::{NoRenewal, RenewalPolicy};
use crate::status::{DownloadStatus, StatusFilter, UploadStatus};

/// Handle to the storage subsystem. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Repository {
    db: Arc<MetadataDb>,
    content: Arc<ContentStore>,
    locks: Arc<KeyedLocks>,
    counters: Arc<ReconcileCounters>,
    renewal: Arc<dyn RenewalPolicy>,
    config: Arc<Config>,
}

impl Repository {
    /// Assemble a repository from already-opened stores
    pub fn new(db: MetadataDb, content: ContentStore, config: Config) -> Self {
        Self {
            db: Arc::new(db),
            content: Arc::new(content),
            locks: Arc::new(KeyedLocks::new()),
            counters: Arc::new(ReconcileCounters::default()),
            renewal: Arc::new(NoRenewal),
            config: Arc::new(config),
        }
    }

    /// Open the metadata database and chunk cache described by `config`
    pub async fn open(config: Config) -> Result<Self, StorageError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.storage_dir).await?;

        let content = ContentStore::new(config.cache_dir()).await?;
        let db = MetadataDb::open(&config.metadata_db_path())?;

        info!(
            storage_dir = %config.storage_dir.display(),
            default_redundancy = config.default_redundancy,
            "Opened chunk repository"
        );

        Ok(Self::new(db, content, config))
    }

    /// In-memory metadata with chunk bytes under `config.cache_dir()` (for tests)
    pub async fn open_in_memory(config: Config) -> Result<Self, StorageError> {
        config.validate()?;
        let content = ContentStore::new(config.cache_dir()).await?;
        let db = MetadataDb::open_in_memory()?;
        Ok(Self::new(db, content, config))
    }

    /// Replace the autorenew hook
    pub fn with_renewal_policy(mut self, policy: Arc<dyn RenewalPolicy>) -> Self {
        self.renewal = policy;
        self
    }

    pub fn db(&self) -> &MetadataDb {
        &self.db
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    pub fn counters(&self) -> &ReconcileCounters {
        &self.counters
    }

    pub fn renewal(&self) -> &dyn RenewalPolicy {
        self.renewal.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Files that are uploaded or downloaded, as listing summaries
    pub async fn list_files(&self) -> Result<Vec<FileSummary>, StorageError> {
        let rows = self.db.with_conn(|conn| db::files::list_files_with_counts(conn))?;

        Ok(rows
            .into_iter()
            .filter(|(file, _)| {
                file.upload_status == UploadStatus::Uploaded
                    || file.download_status == DownloadStatus::Downloaded
            })
            .map(|(file, chunk_count)| FileSummary {
                id: file.id,
                original_path: file.original_path,
                size: file.size,
                redundancy: file.redundancy,
                expires: file.expires,
                autorenew: file.autorenew,
                chunk_count,
                upload_status: file.upload_status,
                download_status: file.download_status,
            })
            .collect())
    }

    /// Uploaded chunks, as listing summaries
    pub async fn list_chunks(&self) -> Result<Vec<ChunkSummary>, StorageError> {
        let chunks = self.db.with_conn(|conn| {
            db::chunks::chunks_by(conn, StatusFilter::Upload(UploadStatus::Uploaded))
        })?;

        Ok(chunks
            .into_iter()
            .filter_map(|chunk| {
                Some(ChunkSummary {
                    id: chunk.id()?.to_string(),
                    size: chunk.size,
                    redundancy: chunk.redundancy,
                    expires: chunk.expires,
                    autorenew: chunk.autorenew,
                    upload_status: chunk.upload_status,
                    download_status: chunk.download_status,
                })
            })
            .collect())
    }

    /// Combined metadata and disk statistics
    pub async fn stats(&self) -> Result<RepositoryStats, StorageError> {
        let metadata = self.db.stats()?;
        let content = self.content.stats().await?;
        Ok(RepositoryStats {
            metadata,
            content,
            reconcile: self.counters.snapshot(),
        })
    }
}

/// File listing entry
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub id: String,
    pub original_path: Option<String>,
    pub size: u64,
    pub redundancy: u32,
    pub expires: i64,
    pub autorenew: bool,
    pub chunk_count: u64,
    pub upload_status: UploadStatus,
    pub download_status: DownloadStatus,
}

/// Chunk listing entry
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub id: String,
    pub size: Option<u64>,
    pub redundancy: u32,
    pub expires: i64,
    pub autorenew: bool,
    pub upload_status: UploadStatus,
    pub download_status: DownloadStatus,
}

#[derive(Debug, Clone)]
pub struct RepositoryStats {
    pub metadata: DbStats,
    pub content: ContentStats,
    pub reconcile: CounterSnapshot,
}

/// Running totals of reconciliation work
#[derive(Debug, Default)]
pub struct ReconcileCounters {
    chunk_reconsiderations: AtomicU64,
    file_reconsiderations: AtomicU64,
    status_changes: AtomicU64,
}

impl ReconcileCounters {
    pub(crate) fn record_chunk(&self) {
        self.chunk_reconsiderations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file(&self) {
        self.file_reconsiderations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_status_change(&self) {
        self.status_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            chunk_reconsiderations: self.chunk_reconsiderations.load(Ordering::Relaxed),
            file_reconsiderations: self.file_reconsiderations.load(Ordering::Relaxed),
            status_changes: self.status_changes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub chunk_reconsiderations: u64,
    pub file_reconsiderations: u64,
    pub status_changes: u64,
}

impl CounterSnapshot {
    /// Work done between `earlier` and `self`
    pub fn since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            chunk_reconsiderations: self.chunk_reconsiderations - earlier.chunk_reconsiderations,
            file_reconsiderations: self.file_reconsiderations - earlier.file_reconsiderations,
            status_changes: self.status_changes - earlier.status_changes,
        }
    }
}
