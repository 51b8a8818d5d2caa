//! Replication agreements
//!
//! A `StorageLink` is one provider's agreement to hold one chunk until
//! `expires`. Links are created and moved through their statuses by the
//! replication layer; the reconciler only reads them (signed links are the
//! live copies counted toward a chunk's redundancy).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db;
use crate::error::StorageError;
use crate::repository::Repository;
use crate::status::LinkStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLink {
    pub id: String,
    pub chunk_id: String,
    pub provider_id: String,
    pub status: LinkStatus,
    /// Unix milliseconds
    pub expires: i64,
}

impl StorageLink {
    /// Record a new replication attempt in `Proposed` status
    pub async fn propose(
        repo: &Repository,
        chunk_id: &str,
        provider_id: &str,
        expires: i64,
    ) -> Result<StorageLink, StorageError> {
        Self::record(repo, chunk_id, provider_id, LinkStatus::Proposed, expires).await
    }

    /// Record an agreement with an explicit status, e.g. one the replication
    /// layer negotiated end to end before reporting it
    pub async fn record(
        repo: &Repository,
        chunk_id: &str,
        provider_id: &str,
        status: LinkStatus,
        expires: i64,
    ) -> Result<StorageLink, StorageError> {
        if chunk_id.is_empty() || provider_id.is_empty() {
            return Err(StorageError::InvalidInput(
                "Storage link needs a chunk id and a provider id".into(),
            ));
        }

        let link = StorageLink {
            id: uuid::Uuid::new_v4().to_string(),
            chunk_id: chunk_id.to_string(),
            provider_id: provider_id.to_string(),
            status,
            expires,
        };
        repo.db().with_conn(|conn| db::links::insert_link(conn, &link))?;

        debug!(
            link_id = %link.id,
            chunk_id = %link.chunk_id,
            provider = %link.provider_id,
            status = %link.status,
            "Recorded storage link"
        );
        Ok(link)
    }

    pub async fn find(repo: &Repository, id: &str) -> Result<Option<StorageLink>, StorageError> {
        repo.db().with_conn(|conn| db::links::get_link(conn, id))
    }

    pub async fn find_or_fail(repo: &Repository, id: &str) -> Result<StorageLink, StorageError> {
        Self::find(repo, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("storage link {}", id)))
    }

    /// Links for one chunk in one status
    pub async fn by_chunk_and_status(
        repo: &Repository,
        chunk_id: &str,
        status: LinkStatus,
    ) -> Result<Vec<StorageLink>, StorageError> {
        repo.db()
            .with_conn(|conn| db::links::links_by_status(conn, chunk_id, status))
    }

    /// Links for one chunk across every status
    pub async fn all_for_chunk(repo: &Repository, chunk_id: &str) -> Result<Vec<StorageLink>, StorageError> {
        let mut all = Vec::new();
        for status in LinkStatus::ALL {
            all.extend(Self::by_chunk_and_status(repo, chunk_id, status).await?);
        }
        Ok(all)
    }

    /// Move to `status`. Re-applying the current status is a no-op; any
    /// transition outside the agreement lifecycle is rejected.
    /// Returns whether anything changed.
    pub async fn apply_status(&mut self, repo: &Repository, status: LinkStatus) -> Result<bool, StorageError> {
        self.apply_update(repo, status, None).await
    }

    /// Move to `status` and optionally a new end time. An illegal transition
    /// is refused before anything is written. Returns whether the status
    /// changed.
    pub async fn apply_update(
        &mut self,
        repo: &Repository,
        status: LinkStatus,
        expires: Option<i64>,
    ) -> Result<bool, StorageError> {
        if self.status != status && !self.status.can_transition_to(status) {
            return Err(StorageError::InvalidInput(format!(
                "Storage link {} cannot move from {} to {}",
                self.id, self.status, status
            )));
        }

        let expires = expires.unwrap_or(self.expires);
        match (self.status != status, self.expires != expires) {
            (false, false) => return Ok(false),
            (true, false) => {
                repo.db()
                    .with_conn(|conn| db::links::set_status(conn, &self.id, status))?;
            }
            (false, true) => {
                repo.db()
                    .with_conn(|conn| db::links::set_expires(conn, &self.id, expires))?;
            }
            (true, true) => {
                repo.db().with_conn_mut(|conn| {
                    db::links::set_status_and_expires(conn, &self.id, status, expires)
                })?;
            }
        }

        let changed = self.status != status;
        if changed {
            debug!(link_id = %self.id, from = %self.status, to = %status, "Storage link status changed");
        }
        self.status = status;
        self.expires = expires;
        Ok(changed)
    }

    /// Change the agreement's end time (renewal or renegotiation)
    pub async fn set_expires(&mut self, repo: &Repository, expires: i64) -> Result<(), StorageError> {
        if self.expires == expires {
            return Ok(());
        }
        repo.db()
            .with_conn(|conn| db::links::set_expires(conn, &self.id, expires))?;
        self.expires = expires;
        Ok(())
    }

    /// Whether this link counts as a live copy
    pub fn is_live(&self) -> bool {
        self.status.is_live()
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
    async fn test_links_grouped_by_status() {
        let (repo, _temp) = repo().await;

        StorageLink::record(&repo, "c1", "p1", LinkStatus::Signed, 100).await.unwrap();
        StorageLink::record(&repo, "c1", "p2", LinkStatus::Signed, 100).await.unwrap();
        StorageLink::propose(&repo, "c1", "p3", 100).await.unwrap();
        StorageLink::record(&repo, "c2", "p1", LinkStatus::Signed, 100).await.unwrap();

        let signed = StorageLink::by_chunk_and_status(&repo, "c1", LinkStatus::Signed).await.unwrap();
        assert_eq!(signed.len(), 2);
        assert!(signed.iter().all(|l| l.is_live()));

        let all = StorageLink::all_for_chunk(&repo, "c1").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_status_lifecycle() {
        let (repo, _temp) = repo().await;

        let mut link = StorageLink::propose(&repo, "c1", "p1", 100).await.unwrap();
        assert!(link.apply_status(&repo, LinkStatus::Signed).await.unwrap());
        assert!(!link.apply_status(&repo, LinkStatus::Signed).await.unwrap());

        let stored = StorageLink::find_or_fail(&repo, &link.id).await.unwrap();
        assert_eq!(stored.status, LinkStatus::Signed);

        let err = link.apply_status(&repo, LinkStatus::Proposed).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));

        link.set_expires(&repo, 50).await.unwrap();
        assert_eq!(StorageLink::find_or_fail(&repo, &link.id).await.unwrap().expires, 50);
    }

    #[tokio::test]
    async fn test_refused_update_writes_nothing() {
        let (repo, _temp) = repo().await;

        let mut link = StorageLink::record(&repo, "c1", "p1", LinkStatus::Signed, 100).await.unwrap();

        let err = link.apply_update(&repo, LinkStatus::Proposed, Some(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
        assert_eq!(link.expires, 100);

        let stored = StorageLink::find_or_fail(&repo, &link.id).await.unwrap();
        assert_eq!(stored.status, LinkStatus::Signed);
        assert_eq!(stored.expires, 100);

        // Renewal without a status change is still accepted
        assert!(!link.apply_update(&repo, LinkStatus::Signed, Some(200)).await.unwrap());
        assert!(link.apply_update(&repo, LinkStatus::Expired, Some(300)).await.unwrap());
        let stored = StorageLink::find_or_fail(&repo, &link.id).await.unwrap();
        assert_eq!((stored.status, stored.expires), (LinkStatus::Expired, 300));
    }

    #[tokio::test]
    async fn test_missing_link_is_not_found() {
        let (repo, _temp) = repo().await;
        let err = StorageLink::find_or_fail(&repo, "nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
