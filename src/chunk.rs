//! Content-addressed chunks
//!
//! A chunk's id is the hex SHA256 of its bytes. Once assigned it never
//! changes, and bytes that hash to anything else are refused
//! (`IntegrityMismatch`), never written over the stored copy.
//!
//! Upload and download lifecycles are tracked independently. Status writes
//! go through `change_*_status`, which are no-ops when nothing changes.

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::content_store::ContentStore;
use crate::db;
use crate::db::chunks::ChunkPolicy;
use crate::error::StorageError;
use crate::file::File;
use crate::locks::chunk_key;
use crate::reconcile::{evaluate_upload, UploadVerdict};
use crate::repository::Repository;
use crate::status::{Cascade, DownloadStatus, LinkStatus, StatusFilter, UploadStatus};
use crate::storage_link::StorageLink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unassigned until bytes are set on a freshly built chunk
    pub(crate) id: Option<String>,
    pub size: Option<u64>,
    pub upload_status: UploadStatus,
    pub download_status: DownloadStatus,
    /// Live copies required
    pub redundancy: u32,
    /// Unix milliseconds; live copies must last at least this long
    pub expires: i64,
    pub autorenew: bool,
}

impl Chunk {
    /// New chunk with no id yet; `set_data` assigns one
    pub fn build(redundancy: u32, expires: i64, autorenew: bool) -> Chunk {
        Chunk {
            id: None,
            size: None,
            upload_status: UploadStatus::Created,
            download_status: DownloadStatus::Created,
            redundancy,
            expires,
            autorenew,
        }
    }

    /// New chunk known only by id (e.g. a file needs it but its bytes are
    /// not local yet)
    pub fn build_for_id(id: &str, redundancy: u32, expires: i64, autorenew: bool) -> Chunk {
        Chunk {
            id: Some(id.to_string()),
            ..Self::build(redundancy, expires, autorenew)
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The assigned id, which must be a hex SHA256 digest
    pub(crate) fn require_id(&self) -> Result<&str, StorageError> {
        let id = self
            .id
            .as_deref()
            .ok_or_else(|| StorageError::InvalidInput("Chunk has no id assigned".into()))?;
        ContentStore::validate_id(id)?;
        Ok(id)
    }

    pub async fn find(repo: &Repository, id: &str) -> Result<Option<Chunk>, StorageError> {
        repo.db().with_conn(|conn| db::chunks::get_chunk(conn, id))
    }

    pub async fn find_or_fail(repo: &Repository, id: &str) -> Result<Chunk, StorageError> {
        Self::find(repo, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("chunk {}", id)))
    }

    /// All chunks whose upload or download status matches
    pub async fn all_by(repo: &Repository, filter: StatusFilter) -> Result<Vec<Chunk>, StorageError> {
        repo.db().with_conn(|conn| db::chunks::chunks_by(conn, filter))
    }

    /// Persist the metadata row if it does not exist yet
    pub async fn create(&self, repo: &Repository) -> Result<bool, StorageError> {
        let id = self.require_id()?;
        repo.db()
            .with_conn(|conn| db::chunks::insert_chunk_if_absent(conn, id, self))
    }

    /// Attach bytes to this chunk.
    ///
    /// An unassigned chunk adopts the bytes' hash as its id. An assigned
    /// chunk only accepts bytes hashing to its id; anything else fails with
    /// `IntegrityMismatch` before touching disk.
    pub async fn set_data(&mut self, repo: &Repository, data: &[u8]) -> Result<(), StorageError> {
        let hash = ContentStore::compute_hash(data);

        match self.id.as_deref() {
            Some(id) if id != hash => {
                error!(chunk_id = %id, actual = %hash, size = data.len(), "Chunk data does not match its id");
                return Err(StorageError::IntegrityMismatch {
                    expected: id.to_string(),
                    actual: hash,
                });
            }
            Some(_) => {}
            None => self.id = Some(hash.clone()),
        }

        repo.content().put(data).await?;

        self.download_status = DownloadStatus::Downloaded;
        self.size = Some(data.len() as u64);

        repo.db().with_conn(|conn| {
            db::chunks::insert_chunk_if_absent(conn, &hash, self)?;
            db::chunks::set_chunk_data(conn, &hash, data.len() as u64, DownloadStatus::Downloaded.as_code())
        })?;

        // Pick up statuses other writers may have persisted
        self.refresh(repo).await
    }

    /// Find the chunk for these bytes, creating it with the configured
    /// defaults if needed. Idempotent for identical content.
    pub async fn find_or_create_by_data(repo: &Repository, data: &[u8]) -> Result<Chunk, StorageError> {
        let id = ContentStore::compute_hash(data);
        let _guard = repo.locks().lock(&chunk_key(&id)).await;
        Self::find_or_create_by_data_locked(repo, &id, data).await
    }

    /// Caller holds the chunk lock for `id`
    pub(crate) async fn find_or_create_by_data_locked(
        repo: &Repository,
        id: &str,
        data: &[u8],
    ) -> Result<Chunk, StorageError> {
        let mut chunk = match Self::find(repo, id).await? {
            Some(existing) => existing,
            None => {
                let config = repo.config();
                Chunk::build_for_id(id, config.default_redundancy, config.default_expires_at(), false)
            }
        };
        chunk.set_data(repo, data).await?;
        Ok(chunk)
    }

    /// Read this chunk's bytes from the content store
    pub async fn get_data(&self, repo: &Repository) -> Result<Vec<u8>, StorageError> {
        repo.content().get(self.require_id()?).await
    }

    /// Recorded size, falling back to the size on disk
    pub async fn size(&self, repo: &Repository) -> Result<u64, StorageError> {
        match self.size {
            Some(size) => Ok(size),
            None => repo.content().size_of(self.require_id()?).await,
        }
    }

    /// Whether the bytes are present locally
    pub async fn has_data(&self, repo: &Repository) -> Result<bool, StorageError> {
        Ok(repo.content().exists(self.require_id()?).await)
    }

    /// Re-read persisted state
    pub async fn refresh(&mut self, repo: &Repository) -> Result<(), StorageError> {
        let id = self.require_id()?.to_string();
        *self = Self::find_or_fail(repo, &id).await?;
        Ok(())
    }

    /// Persist a new upload status. Returns whether anything changed.
    pub async fn change_upload_status(&mut self, repo: &Repository, status: UploadStatus) -> Result<bool, StorageError> {
        if self.upload_status == status {
            return Ok(false);
        }
        let id = self.require_id()?;
        repo.db()
            .with_conn(|conn| db::chunks::set_upload_status(conn, id, status.as_code()))?;
        debug!(chunk_id = %id, from = %self.upload_status, to = %status, "Chunk upload status changed");
        repo.counters().record_status_change();
        self.upload_status = status;
        Ok(true)
    }

    /// Persist a new download status. Returns whether anything changed.
    pub async fn change_download_status(&mut self, repo: &Repository, status: DownloadStatus) -> Result<bool, StorageError> {
        if self.download_status == status {
            return Ok(false);
        }
        let id = self.require_id()?;
        repo.db()
            .with_conn(|conn| db::chunks::set_download_status(conn, id, status.as_code()))?;
        debug!(chunk_id = %id, from = %self.download_status, to = %status, "Chunk download status changed");
        repo.counters().record_status_change();
        self.download_status = status;
        Ok(true)
    }

    pub fn is_uploading(&self) -> bool {
        self.upload_status == UploadStatus::Uploading
    }

    pub fn is_downloading(&self) -> bool {
        self.download_status == DownloadStatus::Downloading
    }

    /// Storage links for this chunk in one status
    pub async fn links_with_status(&self, repo: &Repository, status: LinkStatus) -> Result<Vec<StorageLink>, StorageError> {
        StorageLink::by_chunk_and_status(repo, self.require_id()?, status).await
    }

    /// Storage links for this chunk in every status
    pub async fn all_links(&self, repo: &Repository) -> Result<Vec<StorageLink>, StorageError> {
        StorageLink::all_for_chunk(repo, self.require_id()?).await
    }

    /// Files whose map references this chunk
    pub async fn owning_files(&self, repo: &Repository) -> Result<Vec<File>, StorageError> {
        let id = self.require_id()?;
        let file_ids = repo
            .db()
            .with_conn(|conn| db::chunks::owning_file_ids(conn, id))?;

        let mut files = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            files.push(File::find_or_fail(repo, &file_id).await?);
        }
        Ok(files)
    }

    /// Bind this chunk to `file` at position `index`. Does not persist the chunk.
    pub async fn add_to_file(&self, repo: &Repository, file_id: &str, index: u32) -> Result<(), StorageError> {
        let id = self.require_id()?;
        repo.db()
            .with_conn(|conn| db::files::insert_map_row(conn, file_id, id, index))
    }

    /// Set redundancy/expiry/autorenew to the strictest demand among the
    /// files referencing this chunk. Unreferenced chunks keep their policy.
    pub async fn apply_file_policies(&mut self, repo: &Repository) -> Result<(), StorageError> {
        let id = self.require_id()?.to_string();
        let policy = repo
            .db()
            .with_conn(|conn| db::chunks::strictest_file_policy(conn, &id))?;

        if let Some(policy) = policy {
            let current = ChunkPolicy {
                redundancy: self.redundancy,
                expires: self.expires,
                autorenew: self.autorenew,
            };
            if policy != current {
                repo.db()
                    .with_conn(|conn| db::chunks::set_policy(conn, &id, &policy))?;
                self.redundancy = policy.redundancy;
                self.expires = policy.expires;
                self.autorenew = policy.autorenew;
            }
        }
        Ok(())
    }

    /// Replicas still needed: the redundancy target minus live copies that
    /// cover the retention window, minus proposals already in flight
    pub async fn replica_deficit(&self, repo: &Repository) -> Result<usize, StorageError> {
        let durable = self
            .links_with_status(repo, LinkStatus::Signed)
            .await?
            .iter()
            .filter(|l| l.expires >= self.expires)
            .count();
        let pending = self.links_with_status(repo, LinkStatus::Proposed).await?.len();

        Ok((self.redundancy as usize)
            .saturating_sub(durable)
            .saturating_sub(pending))
    }

    /// Recompute this chunk's upload status from its live copies.
    ///
    /// With `Cascade::Once`, every file referencing the chunk then
    /// re-aggregates its own status (without touching chunks again).
    pub async fn reconsider_upload_status(&mut self, repo: &Repository, cascade: Cascade) -> Result<UploadStatus, StorageError> {
        self.reconcile_upload(repo).await?;

        if cascade == Cascade::Once {
            let id = self.require_id()?.to_string();
            cascade_to_files(repo, &id, FileSide::Upload, None).await?;
        }
        Ok(self.upload_status)
    }

    /// The chunk-local part of upload reconsideration, atomic per chunk.
    /// Returns whether the stored status changed.
    pub(crate) async fn reconcile_upload(&mut self, repo: &Repository) -> Result<bool, StorageError> {
        let id = self.require_id()?.to_string();
        let _guard = repo.locks().lock(&chunk_key(&id)).await;
        repo.counters().record_chunk();

        // Start from persisted state so a stale copy never overwrites a fresher status
        self.refresh(repo).await?;

        let live = self.links_with_status(repo, LinkStatus::Signed).await?;
        let verdict = evaluate_upload(self, &live);

        match &verdict {
            UploadVerdict::UnderReplicated { live, required } => {
                debug!(chunk_id = %id, live, required, "Chunk under-replicated");
            }
            UploadVerdict::Expiring { link_id, link_expires, required_until } => {
                debug!(chunk_id = %id, link_id = %link_id, link_expires, required_until, "Live copy lapses early");
            }
            UploadVerdict::Replicated => {
                repo.renewal().review(self, &live);
            }
        }

        let changed = self.change_upload_status(repo, verdict.status()).await?;
        self.refresh(repo).await?;

        Ok(changed)
    }

    /// Record whether the bytes are now local. Deciding when a chunk is
    /// wanted belongs to the replication layer (`mark_wanted`).
    pub async fn reconsider_download_status(&mut self, repo: &Repository, cascade: Cascade) -> Result<DownloadStatus, StorageError> {
        self.reconcile_download(repo).await?;

        if cascade == Cascade::Once {
            let id = self.require_id()?.to_string();
            cascade_to_files(repo, &id, FileSide::Download, None).await?;
        }
        Ok(self.download_status)
    }

    pub(crate) async fn reconcile_download(&mut self, repo: &Repository) -> Result<bool, StorageError> {
        let id = self.require_id()?.to_string();
        let _guard = repo.locks().lock(&chunk_key(&id)).await;
        repo.counters().record_chunk();

        self.refresh(repo).await?;

        let mut changed = false;
        if self.download_status != DownloadStatus::Downloaded && self.has_data(repo).await? {
            changed = self.change_download_status(repo, DownloadStatus::Downloaded).await?;
        }

        self.refresh(repo).await?;
        Ok(changed)
    }

    /// Mark the chunk as wanted: `Created | Failed -> Downloading`
    pub async fn mark_wanted(&mut self, repo: &Repository) -> Result<DownloadStatus, StorageError> {
        let id = self.require_id()?.to_string();
        let _guard = repo.locks().lock(&chunk_key(&id)).await;
        self.refresh(repo).await?;

        if matches!(self.download_status, DownloadStatus::Created | DownloadStatus::Failed) {
            self.change_download_status(repo, DownloadStatus::Downloading).await?;
        }
        Ok(self.download_status)
    }

    /// Record a failed fetch: `Downloading -> Failed`
    pub async fn mark_failed(&mut self, repo: &Repository) -> Result<DownloadStatus, StorageError> {
        let id = self.require_id()?.to_string();
        let _guard = repo.locks().lock(&chunk_key(&id)).await;
        self.refresh(repo).await?;

        if self.download_status == DownloadStatus::Downloading {
            self.change_download_status(repo, DownloadStatus::Failed).await?;
        }
        Ok(self.download_status)
    }
}

#[derive(Clone, Copy)]
pub(crate) enum FileSide {
    Upload,
    Download,
}

/// Re-aggregate every file referencing `chunk_id` except `skip`,
/// concurrently up to the configured limit. One file failing does not stop
/// the others; the first error is returned once all have run.
pub(crate) async fn cascade_to_files(
    repo: &Repository,
    chunk_id: &str,
    side: FileSide,
    skip: Option<&str>,
) -> Result<(), StorageError> {
    let file_ids: Vec<String> = repo
        .db()
        .with_conn(|conn| db::chunks::owning_file_ids(conn, chunk_id))?
        .into_iter()
        .filter(|file_id| Some(file_id.as_str()) != skip)
        .collect();

    let results: Vec<Result<(), StorageError>> = stream::iter(file_ids)
        .map(|file_id| async move {
            let mut file = File::find_or_fail(repo, &file_id).await?;
            match side {
                FileSide::Upload => file.aggregate_upload(repo).await.map(|_| ()),
                FileSide::Download => file.aggregate_download(repo).await.map(|_| ()),
            }
        })
        .buffer_unordered(repo.config().max_concurrent_reconciliations)
        .collect()
        .await;

    let mut first_error = None;
    for result in results {
        if let Err(e) = result {
            warn!(chunk_id = %chunk_id, error = %e, "File reconsideration failed during cascade");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn repo() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::open_in_memory(Config::with_storage_dir(temp_dir.path()))
            .await
            .unwrap();
        (repo, temp_dir)
    }

    #[tokio::test]
    async fn test_set_data_assigns_id() {
        let (repo, _temp) = repo().await;

        let mut chunk = Chunk::build(2, 1_000, false);
        chunk.set_data(&repo, b"some bytes").await.unwrap();

        assert_eq!(chunk.id(), Some(ContentStore::compute_hash(b"some bytes").as_str()));
        assert_eq!(chunk.size, Some(10));
        assert_eq!(chunk.download_status, DownloadStatus::Downloaded);
        assert_eq!(chunk.upload_status, UploadStatus::Created);
        assert_eq!(chunk.get_data(&repo).await.unwrap(), b"some bytes");
    }

    #[tokio::test]
    async fn test_set_data_rejects_mismatched_bytes() {
        let (repo, _temp) = repo().await;

        let mut chunk = Chunk::find_or_create_by_data(&repo, b"original").await.unwrap();
        let err = chunk.set_data(&repo, b"tampered").await.unwrap_err();

        assert!(matches!(err, StorageError::IntegrityMismatch { .. }));
        assert!(err.is_fatal());
        assert_eq!(chunk.get_data(&repo).await.unwrap(), b"original");
        assert!(!repo.content().exists(&ContentStore::compute_hash(b"tampered")).await);
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let (repo, _temp) = repo().await;

        let first = Chunk::find_or_create_by_data(&repo, b"same").await.unwrap();
        let second = Chunk::find_or_create_by_data(&repo, b"same").await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(repo.db().stats().unwrap().chunk_count, 1);
        assert_eq!(second.redundancy, repo.config().default_redundancy);
    }

    #[tokio::test]
    async fn test_change_status_is_idempotent() {
        let (repo, _temp) = repo().await;

        let mut chunk = Chunk::find_or_create_by_data(&repo, b"status").await.unwrap();
        assert!(chunk.change_upload_status(&repo, UploadStatus::Uploading).await.unwrap());
        assert!(!chunk.change_upload_status(&repo, UploadStatus::Uploading).await.unwrap());
        assert!(chunk.is_uploading());

        let stored = Chunk::find_or_fail(&repo, chunk.id().unwrap()).await.unwrap();
        assert_eq!(stored.upload_status, UploadStatus::Uploading);
        assert_eq!(repo.counters().snapshot().status_changes, 1);
    }

    #[tokio::test]
    async fn test_reconsider_follows_signed_links() {
        let (repo, _temp) = repo().await;

        let mut chunk = Chunk::find_or_create_by_data(&repo, b"replicate me").await.unwrap();
        let id = chunk.id().unwrap().to_string();
        let far = chunk.expires + 1_000;

        StorageLink::record(&repo, &id, "p1", LinkStatus::Signed, far).await.unwrap();
        let status = chunk.reconsider_upload_status(&repo, Cascade::None).await.unwrap();
        assert_eq!(status, UploadStatus::Uploading);

        StorageLink::record(&repo, &id, "p2", LinkStatus::Signed, far).await.unwrap();
        let status = chunk.reconsider_upload_status(&repo, Cascade::None).await.unwrap();
        assert_eq!(status, UploadStatus::Uploaded);
        assert_eq!(chunk.upload_status, UploadStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_download_lifecycle() {
        let (repo, _temp) = repo().await;

        let id = ContentStore::compute_hash(b"remote bytes");
        let mut chunk = Chunk::build_for_id(&id, 1, 1_000, false);
        chunk.create(&repo).await.unwrap();

        assert_eq!(chunk.mark_wanted(&repo).await.unwrap(), DownloadStatus::Downloading);
        assert!(chunk.is_downloading());
        assert_eq!(
            chunk.reconsider_download_status(&repo, Cascade::None).await.unwrap(),
            DownloadStatus::Downloading
        );
        assert_eq!(chunk.mark_failed(&repo).await.unwrap(), DownloadStatus::Failed);
        assert_eq!(chunk.mark_wanted(&repo).await.unwrap(), DownloadStatus::Downloading);

        chunk.set_data(&repo, b"remote bytes").await.unwrap();
        assert_eq!(chunk.download_status, DownloadStatus::Downloaded);
    }

    #[tokio::test]
    async fn test_malformed_id_is_refused() {
        let (repo, _temp) = repo().await;
        let file = File::build("f1", None, 4, 1, 1_000, false);
        file.create(&repo).await.unwrap();

        for id in ["", "../../escape", "C1"] {
            let chunk = Chunk::build_for_id(id, 1, 1_000, false);
            assert!(matches!(chunk.create(&repo).await, Err(StorageError::InvalidInput(_))));
            assert!(matches!(chunk.add_to_file(&repo, "f1", 0).await, Err(StorageError::InvalidInput(_))));
            assert!(matches!(chunk.get_data(&repo).await, Err(StorageError::InvalidInput(_))));
        }
        assert_eq!(repo.db().stats().unwrap().chunk_count, 0);
        assert!(file.chunk_ids(&repo).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replica_deficit_counts_pending_proposals() {
        let (repo, _temp) = repo().await;

        let chunk = Chunk::find_or_create_by_data(&repo, b"deficit").await.unwrap();
        let id = chunk.id().unwrap().to_string();
        assert_eq!(chunk.replica_deficit(&repo).await.unwrap(), 2);

        StorageLink::propose(&repo, &id, "p1", chunk.expires).await.unwrap();
        assert_eq!(chunk.replica_deficit(&repo).await.unwrap(), 1);

        // Signed but lapsing early does not cover the window
        StorageLink::record(&repo, &id, "p2", LinkStatus::Signed, chunk.expires - 1).await.unwrap();
        assert_eq!(chunk.replica_deficit(&repo).await.unwrap(), 1);
    }
}
