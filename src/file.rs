//! Files: named blobs composed of an ordered sequence of chunks
//!
//! A file owns no bytes. Its `file_map` rows bind positions `0..n` to chunk
//! ids, and its statuses are aggregates of those chunks' statuses.

use std::collections::BTreeSet;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunk::{cascade_to_files, Chunk, FileSide};
use crate::content_store::ContentStore;
use crate::db;
use crate::error::StorageError;
use crate::locks::{chunk_key, file_key};
use crate::repository::Repository;
use crate::status::{Cascade, DownloadStatus, StatusFilter, UploadStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub original_path: Option<String>,
    pub size: u64,
    /// Target applied to every constituent chunk
    pub redundancy: u32,
    /// Unix milliseconds
    pub expires: i64,
    pub autorenew: bool,
    pub upload_status: UploadStatus,
    pub download_status: DownloadStatus,
}

/// Options for `File::store`
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Externally assigned id; derived from the chunk ids when absent
    pub id: Option<String>,
    pub original_path: Option<String>,
    /// Defaults to `Config::default_redundancy`
    pub redundancy: Option<u32>,
    /// Unix milliseconds; defaults to now + `Config::default_expiry_secs`
    pub expires: Option<i64>,
    pub autorenew: bool,
}

impl File {
    pub fn build(
        id: &str,
        original_path: Option<String>,
        size: u64,
        redundancy: u32,
        expires: i64,
        autorenew: bool,
    ) -> File {
        File {
            id: id.to_string(),
            original_path,
            size,
            redundancy,
            expires,
            autorenew,
            upload_status: UploadStatus::Created,
            download_status: DownloadStatus::Created,
        }
    }

    /// Content-derived file id: hash of the ordered chunk ids
    pub fn derive_id(chunk_ids: &[String]) -> String {
        ContentStore::compute_hash(chunk_ids.concat().as_bytes())
    }

    pub async fn find(repo: &Repository, id: &str) -> Result<Option<File>, StorageError> {
        repo.db().with_conn(|conn| db::files::get_file(conn, id))
    }

    pub async fn find_or_fail(repo: &Repository, id: &str) -> Result<File, StorageError> {
        Self::find(repo, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("file {}", id)))
    }

    /// All files whose upload or download status matches
    pub async fn all_by(repo: &Repository, filter: StatusFilter) -> Result<Vec<File>, StorageError> {
        repo.db().with_conn(|conn| db::files::files_by(conn, filter))
    }

    /// Persist the file row if it does not exist yet
    pub async fn create(&self, repo: &Repository) -> Result<bool, StorageError> {
        if self.redundancy == 0 {
            return Err(StorageError::InvalidInput(format!(
                "File {} needs a redundancy of at least 1",
                self.id
            )));
        }
        repo.db()
            .with_conn(|conn| db::files::insert_file_if_absent(conn, self))
    }

    /// Split `data` into chunks, store them, assemble the file and reconcile it.
    ///
    /// Storing a blob whose file already exists returns that file, with its
    /// policy raised to the stricter of the two requests.
    pub async fn store(repo: &Repository, data: &[u8], options: StoreOptions) -> Result<File, StorageError> {
        let config = repo.config();
        let redundancy = options.redundancy.unwrap_or(config.default_redundancy);
        let expires = options.expires.unwrap_or_else(|| config.default_expires_at());

        let pieces: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(config.chunk_size_bytes).collect()
        };
        let chunk_ids: Vec<String> = pieces.iter().map(|p| ContentStore::compute_hash(p)).collect();
        let file_id = options.id.clone().unwrap_or_else(|| Self::derive_id(&chunk_ids));

        let file = File::build(
            &file_id,
            options.original_path.clone(),
            data.len() as u64,
            redundancy,
            expires,
            options.autorenew,
        );

        if !file.create(repo).await? {
            let mut existing = Self::find_or_fail(repo, &file_id).await?;
            let bound = existing.map_chunk_ids(repo).await?;
            if !bound.is_empty() && bound != chunk_ids {
                return Err(StorageError::InvalidInput(format!(
                    "File {} is already bound to different content",
                    file_id
                )));
            }
            existing
                .raise_policy(repo, redundancy, expires, options.autorenew)
                .await?;
            debug!(file_id = %file_id, "File already stored");
        }

        for (index, (piece, chunk_id)) in pieces.iter().zip(chunk_ids.iter()).enumerate() {
            // Held until the map row exists, so a concurrent delete cannot
            // orphan the chunk in between
            let _guard = repo.locks().lock(&chunk_key(chunk_id)).await;
            let mut chunk = Chunk::find_or_create_by_data_locked(repo, chunk_id, piece).await?;
            chunk.add_to_file(repo, &file_id, index as u32).await?;
            chunk.apply_file_policies(repo).await?;
        }

        let mut file = Self::find_or_fail(repo, &file_id).await?;
        file.chunk_ids(repo).await?;

        file.reconsider_upload_status(repo, Cascade::Once).await?;
        file.aggregate_download(repo).await?;

        info!(
            file_id = %file.id,
            size = file.size,
            chunks = chunk_ids.len(),
            status = %file.upload_status,
            "Stored file"
        );
        Ok(file)
    }

    /// Bind `chunk` to this file at `index`. The chunk itself is not persisted.
    ///
    /// Indices may arrive in any order, but the file is only complete once
    /// they run from 0 with no gaps.
    pub async fn add_chunk(&self, repo: &Repository, chunk: &Chunk, index: u32) -> Result<(), StorageError> {
        chunk.add_to_file(repo, &self.id, index).await
    }

    /// Chunk ids exactly as mapped, in index order, without validation
    async fn map_chunk_ids(&self, repo: &Repository) -> Result<Vec<String>, StorageError> {
        let rows = repo
            .db()
            .with_conn(|conn| db::files::map_rows(conn, &self.id))?;
        Ok(rows.into_iter().map(|row| row.chunk_id).collect())
    }

    /// Ordered chunk ids. Fails with `InvalidInput` if the indices are not
    /// contiguous from 0.
    pub async fn chunk_ids(&self, repo: &Repository) -> Result<Vec<String>, StorageError> {
        let rows = repo
            .db()
            .with_conn(|conn| db::files::map_rows(conn, &self.id))?;

        for (expected, row) in rows.iter().enumerate() {
            if row.chunk_index as usize != expected {
                return Err(StorageError::InvalidInput(format!(
                    "File {} chunk map has a gap at index {}",
                    self.id, expected
                )));
            }
        }
        Ok(rows.into_iter().map(|row| row.chunk_id).collect())
    }

    /// Whether the chunk map is non-empty and contiguous
    pub async fn is_complete(&self, repo: &Repository) -> Result<bool, StorageError> {
        match self.chunk_ids(repo).await {
            Ok(ids) => Ok(!ids.is_empty()),
            Err(StorageError::InvalidInput(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Constituent chunks in index order (repeats included)
    pub async fn chunks(&self, repo: &Repository) -> Result<Vec<Chunk>, StorageError> {
        let mut chunks = Vec::new();
        for id in self.chunk_ids(repo).await? {
            chunks.push(Chunk::find_or_fail(repo, &id).await?);
        }
        Ok(chunks)
    }

    /// Concatenate chunk bytes in index order.
    ///
    /// Fails with `IncompleteFile` listing every chunk whose bytes are not
    /// available locally.
    pub async fn reconstruct(&self, repo: &Repository) -> Result<Vec<u8>, StorageError> {
        let ids = self.chunk_ids(repo).await?;
        if ids.is_empty() {
            return Err(StorageError::IncompleteFile {
                file_id: self.id.clone(),
                missing: vec![],
            });
        }

        let mut data = Vec::with_capacity(self.size as usize);
        let mut missing: Vec<String> = Vec::new();

        for id in &ids {
            match repo.content().get(id).await {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(StorageError::NotFound(_)) => {
                    if !missing.contains(id) {
                        missing.push(id.clone());
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if !missing.is_empty() {
            debug!(file_id = %self.id, missing = missing.len(), "File is not fully local");
            return Err(StorageError::IncompleteFile {
                file_id: self.id.clone(),
                missing,
            });
        }
        Ok(data)
    }

    /// Re-read persisted state
    pub async fn refresh(&mut self, repo: &Repository) -> Result<(), StorageError> {
        *self = Self::find_or_fail(repo, &self.id).await?;
        Ok(())
    }

    pub async fn change_upload_status(&mut self, repo: &Repository, status: UploadStatus) -> Result<bool, StorageError> {
        if self.upload_status == status {
            return Ok(false);
        }
        repo.db()
            .with_conn(|conn| db::files::set_upload_status(conn, &self.id, status.as_code()))?;
        debug!(file_id = %self.id, from = %self.upload_status, to = %status, "File upload status changed");
        repo.counters().record_status_change();
        self.upload_status = status;
        Ok(true)
    }

    pub async fn change_download_status(&mut self, repo: &Repository, status: DownloadStatus) -> Result<bool, StorageError> {
        if self.download_status == status {
            return Ok(false);
        }
        repo.db()
            .with_conn(|conn| db::files::set_download_status(conn, &self.id, status.as_code()))?;
        debug!(file_id = %self.id, from = %self.download_status, to = %status, "File download status changed");
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

    /// Distinct chunk ids referenced by the map (no contiguity check)
    async fn distinct_chunk_ids(&self, repo: &Repository) -> Result<Vec<String>, StorageError> {
        let ids: BTreeSet<String> = self.map_chunk_ids(repo).await?.into_iter().collect();
        Ok(ids.into_iter().collect())
    }

    /// Recompute the upload aggregate.
    ///
    /// With `Cascade::Once` every constituent chunk is reconsidered first.
    /// A chunk whose status moves also re-aggregates the other files that
    /// share it, without reconsidering their chunks. With `Cascade::None`
    /// the stored chunk statuses are aggregated as they are.
    pub async fn reconsider_upload_status(&mut self, repo: &Repository, cascade: Cascade) -> Result<UploadStatus, StorageError> {
        let chunk_result = if cascade == Cascade::Once {
            let ids = self.distinct_chunk_ids(repo).await?;
            let file_id = self.id.as_str();
            let results: Vec<Result<(), StorageError>> = stream::iter(ids)
                .map(|id| async move {
                    let mut chunk = Chunk::find_or_fail(repo, &id).await?;
                    if chunk.reconcile_upload(repo).await? {
                        cascade_to_files(repo, &id, FileSide::Upload, Some(file_id)).await?;
                    }
                    Ok::<(), StorageError>(())
                })
                .buffer_unordered(repo.config().max_concurrent_reconciliations)
                .collect()
                .await;
            first_error(&self.id, results)
        } else {
            Ok(())
        };

        let status = self.aggregate_upload(repo).await?;
        chunk_result.map(|_| status)
    }

    /// Recompute the download aggregate; see `reconsider_upload_status`
    pub async fn reconsider_download_status(&mut self, repo: &Repository, cascade: Cascade) -> Result<DownloadStatus, StorageError> {
        let chunk_result = if cascade == Cascade::Once {
            let ids = self.distinct_chunk_ids(repo).await?;
            let file_id = self.id.as_str();
            let results: Vec<Result<(), StorageError>> = stream::iter(ids)
                .map(|id| async move {
                    let mut chunk = Chunk::find_or_fail(repo, &id).await?;
                    if chunk.reconcile_download(repo).await? {
                        cascade_to_files(repo, &id, FileSide::Download, Some(file_id)).await?;
                    }
                    Ok::<(), StorageError>(())
                })
                .buffer_unordered(repo.config().max_concurrent_reconciliations)
                .collect()
                .await;
            first_error(&self.id, results)
        } else {
            Ok(())
        };

        let status = self.aggregate_download(repo).await?;
        chunk_result.map(|_| status)
    }

    /// Uploaded iff every mapped chunk is uploaded. A file with no map
    /// rows keeps its current status.
    pub(crate) async fn aggregate_upload(&mut self, repo: &Repository) -> Result<UploadStatus, StorageError> {
        let _guard = repo.locks().lock(&file_key(&self.id)).await;
        repo.counters().record_file();
        self.refresh(repo).await?;

        let statuses = repo
            .db()
            .with_conn(|conn| db::files::chunk_statuses(conn, &self.id))?;

        if !statuses.is_empty() {
            let all_uploaded = statuses
                .iter()
                .all(|s| matches!(s, Some((UploadStatus::Uploaded, _))));
            let status = if all_uploaded {
                UploadStatus::Uploaded
            } else {
                UploadStatus::Uploading
            };
            self.change_upload_status(repo, status).await?;
        }

        self.refresh(repo).await?;
        Ok(self.upload_status)
    }

    /// Downloaded iff every chunk is; otherwise Failed, Downloading or
    /// Created, in that order of precedence
    pub(crate) async fn aggregate_download(&mut self, repo: &Repository) -> Result<DownloadStatus, StorageError> {
        let _guard = repo.locks().lock(&file_key(&self.id)).await;
        repo.counters().record_file();
        self.refresh(repo).await?;

        let statuses: Vec<DownloadStatus> = repo
            .db()
            .with_conn(|conn| db::files::chunk_statuses(conn, &self.id))?
            .into_iter()
            .map(|s| s.map(|(_, dl)| dl).unwrap_or(DownloadStatus::Created))
            .collect();

        if !statuses.is_empty() {
            let status = if statuses.iter().all(|s| *s == DownloadStatus::Downloaded) {
                DownloadStatus::Downloaded
            } else if statuses.contains(&DownloadStatus::Failed) {
                DownloadStatus::Failed
            } else if statuses.contains(&DownloadStatus::Downloading) {
                DownloadStatus::Downloading
            } else {
                DownloadStatus::Created
            };
            self.change_download_status(repo, status).await?;
        }

        self.refresh(repo).await?;
        Ok(self.download_status)
    }

    /// Raise this file's policy to at least the given values
    async fn raise_policy(&mut self, repo: &Repository, redundancy: u32, expires: i64, autorenew: bool) -> Result<(), StorageError> {
        let redundancy = self.redundancy.max(redundancy);
        let expires = self.expires.max(expires);
        let autorenew = self.autorenew || autorenew;

        if (redundancy, expires, autorenew) != (self.redundancy, self.expires, self.autorenew) {
            repo.db().with_conn(|conn| {
                db::files::set_policy(conn, &self.id, redundancy, expires, autorenew)
            })?;
            self.redundancy = redundancy;
            self.expires = expires;
            self.autorenew = autorenew;
        }
        Ok(())
    }

    /// Change the file-level target, push it down to every chunk (each chunk
    /// keeps the strictest demand of all its files) and reconcile.
    pub async fn update_policy(
        &mut self,
        repo: &Repository,
        redundancy: u32,
        expires: i64,
        autorenew: bool,
    ) -> Result<UploadStatus, StorageError> {
        if redundancy == 0 {
            return Err(StorageError::InvalidInput(format!(
                "File {} needs a redundancy of at least 1",
                self.id
            )));
        }

        repo.db().with_conn(|conn| {
            db::files::set_policy(conn, &self.id, redundancy, expires, autorenew)
        })?;
        self.redundancy = redundancy;
        self.expires = expires;
        self.autorenew = autorenew;

        for id in self.distinct_chunk_ids(repo).await? {
            let _guard = repo.locks().lock(&chunk_key(&id)).await;
            match Chunk::find(repo, &id).await? {
                Some(mut chunk) => chunk.apply_file_policies(repo).await?,
                None => warn!(file_id = %self.id, chunk_id = %id, "Mapped chunk has no metadata"),
            }
        }

        info!(file_id = %self.id, redundancy, expires, autorenew, "File policy updated");
        self.reconsider_upload_status(repo, Cascade::Once).await
    }

    /// Delete this file. Chunks referenced by nothing else are removed
    /// together with their links and bytes. Chunks still shared fall back to
    /// the policy of their remaining files and are reconsidered. Returns the
    /// removed chunk ids.
    pub async fn delete(self, repo: &Repository) -> Result<Vec<String>, StorageError> {
        let chunk_ids = self.distinct_chunk_ids(repo).await?;
        let mut keys: Vec<String> = chunk_ids.iter().map(|id| chunk_key(id)).collect();
        keys.push(file_key(&self.id));

        let guards = repo.locks().lock_many(&keys).await;
        let orphaned = repo
            .db()
            .with_conn_mut(|conn| db::files::delete_file(conn, &self.id))?;
        for chunk_id in &orphaned {
            repo.content().delete(chunk_id).await?;
        }
        drop(guards);

        for id in chunk_ids.iter().filter(|id| !orphaned.contains(*id)) {
            let mut chunk = {
                let _guard = repo.locks().lock(&chunk_key(id)).await;
                let Some(mut chunk) = Chunk::find(repo, id).await? else {
                    continue;
                };
                chunk.apply_file_policies(repo).await?;
                chunk
            };
            chunk.reconsider_upload_status(repo, Cascade::Once).await?;
        }

        info!(file_id = %self.id, removed_chunks = orphaned.len(), "Deleted file");
        Ok(orphaned)
    }
}

fn first_error<T>(file_id: &str, results: Vec<Result<T, StorageError>>) -> Result<(), StorageError> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            warn!(file_id = %file_id, error = %e, "Chunk reconsideration failed");
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
