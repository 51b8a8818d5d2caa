//! Redundancy reconciliation
//!
//! The per-chunk decision is a pure function of the chunk's policy and its
//! live copies (`evaluate_upload`). The `Reconciler` drives it from the three
//! triggers: ingest (via `File::store`), link-status notifications from the
//! replication layer, and periodic sweeps over chunks nearing expiry.
//!
//! ## Upload decision
//!
//! 1. Fewer signed links than `redundancy` -> `Uploading` (stop)
//! 2. Any signed link ending before the chunk's `expires` -> `Uploading` (stop)
//! 3. Autorenew hook (never changes status)
//! 4. Otherwise -> `Uploaded`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::chunk::Chunk;
use crate::config;
use crate::db;
use crate::error::StorageError;
use crate::repository::Repository;
use crate::status::{Cascade, LinkStatus, UploadStatus};
use crate::storage_link::StorageLink;

/// Outcome of evaluating one chunk's replicas
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadVerdict {
    /// Not enough live copies
    UnderReplicated { live: usize, required: u32 },
    /// Enough copies, but one lapses before the chunk's retention window ends
    Expiring {
        link_id: String,
        link_expires: i64,
        required_until: i64,
    },
    /// Adequately and durably replicated
    Replicated,
}

impl UploadVerdict {
    pub fn status(&self) -> UploadStatus {
        match self {
            UploadVerdict::Replicated => UploadStatus::Uploaded,
            _ => UploadStatus::Uploading,
        }
    }
}

/// Decide a chunk's upload status from its live copies.
///
/// Links that are not live are ignored. Enumeration order does not matter:
/// the count and the expiry scan are independent passes, and a redundancy
/// shortfall wins over expiry.
pub fn evaluate_upload(chunk: &Chunk, links: &[StorageLink]) -> UploadVerdict {
    let live: Vec<&StorageLink> = links.iter().filter(|l| l.is_live()).collect();

    if live.len() < chunk.redundancy as usize {
        return UploadVerdict::UnderReplicated {
            live: live.len(),
            required: chunk.redundancy,
        };
    }

    if let Some(lapsing) = live.iter().find(|l| l.expires < chunk.expires) {
        return UploadVerdict::Expiring {
            link_id: lapsing.id.clone(),
            link_expires: lapsing.expires,
            required_until: chunk.expires,
        };
    }

    UploadVerdict::Replicated
}

/// Hook consulted for adequately replicated chunks.
///
/// Reserved for scheduling renewals of `autorenew` chunks ahead of expiry.
/// It observes; it never changes the chunk's status.
pub trait RenewalPolicy: Send + Sync {
    fn review(&self, chunk: &Chunk, live_copies: &[StorageLink]);
}

/// Default policy: does nothing
pub struct NoRenewal;

impl RenewalPolicy for NoRenewal {
    fn review(&self, _chunk: &Chunk, _live_copies: &[StorageLink]) {}
}

/// A provider's offer to hold a chunk until `expires`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOffer {
    pub provider_id: String,
    pub expires: i64,
}

/// The replication/transport layer as seen by the storage core.
///
/// The core never talks to the network; it asks this collaborator for
/// replicas and records what comes back as `Proposed` links.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Ask for up to `wanted` additional replicas of `chunk`
    async fn request_replicas(&self, chunk: &Chunk, wanted: usize) -> Result<Vec<ReplicaOffer>, StorageError>;
}

/// Transport that never finds providers
pub struct NullTransport;

#[async_trait]
impl ReplicationTransport for NullTransport {
    async fn request_replicas(&self, chunk: &Chunk, wanted: usize) -> Result<Vec<ReplicaOffer>, StorageError> {
        debug!(chunk_id = ?chunk.id(), wanted, "No replication transport configured");
        Ok(Vec::new())
    }
}

/// Status change for an existing link, reported by the replication layer
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub link_id: String,
    pub status: LinkStatus,
    /// New agreement end time, if it changed
    pub expires: Option<i64>,
}

/// A chunk the sweep could not reconcile
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub chunk_id: String,
    pub error: String,
}

/// Result of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub reconciled: usize,
    pub uploaded: usize,
    pub uploading: usize,
    pub failures: Vec<SweepFailure>,
    /// Stopped before visiting every due chunk
    pub cancelled: bool,
}

/// Drives reconciliation from link events and periodic sweeps
pub struct Reconciler {
    repo: Repository,
    transport: Arc<dyn ReplicationTransport>,
    cancel: Arc<watch::Sender<bool>>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl Reconciler {
    pub fn new(repo: Repository, transport: Arc<dyn ReplicationTransport>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            repo,
            transport,
            cancel: Arc::new(cancel),
            shutdown: None,
        }
    }

    /// Stop `run` (and any sweep in progress) when a shutdown is broadcast
    pub fn set_shutdown(&mut self, shutdown: broadcast::Receiver<()>) {
        self.shutdown = Some(shutdown);
    }

    /// Request cancellation. In-flight chunks finish; no new chunk starts.
    /// The flag stays set, so later sweeps are cancelled too until `resume`.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Clear a previous cancellation so sweeps visit chunks again
    pub fn resume(&self) {
        self.cancel.send_replace(false);
    }

    /// Receiver observing the cancellation flag
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Reconcile one chunk with a one-level cascade, then ask the transport
    /// for any replicas still missing
    pub async fn reconcile_chunk(&self, chunk_id: &str) -> Result<UploadStatus, StorageError> {
        let mut chunk = Chunk::find_or_fail(&self.repo, chunk_id).await?;
        let status = chunk.reconsider_upload_status(&self.repo, Cascade::Once).await?;

        if status == UploadStatus::Uploading {
            self.request_missing_replicas(&chunk).await?;
        }
        Ok(status)
    }

    async fn request_missing_replicas(&self, chunk: &Chunk) -> Result<(), StorageError> {
        let wanted = chunk.replica_deficit(&self.repo).await?;
        if wanted == 0 {
            return Ok(());
        }
        let chunk_id = chunk.require_id()?;

        let offers = self.transport.request_replicas(chunk, wanted).await?;
        for offer in offers.into_iter().take(wanted) {
            StorageLink::propose(&self.repo, chunk_id, &offer.provider_id, offer.expires).await?;
        }
        Ok(())
    }

    /// Apply a link status change and reconcile the affected chunk
    pub async fn handle_link_event(&self, event: LinkEvent) -> Result<UploadStatus, StorageError> {
        let mut link = StorageLink::find_or_fail(&self.repo, &event.link_id).await?;
        link.apply_update(&self.repo, event.status, event.expires).await?;

        self.reconcile_chunk(&link.chunk_id).await
    }

    /// Reconcile every chunk that is expiring within the sweep horizon or not
    /// yet uploaded. Per-chunk failures are recorded and the sweep continues.
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        let expires_before = config::millis_from_now(self.repo.config().sweep_horizon_secs);
        let ids = self.repo.db().with_conn(|conn| {
            db::chunks::chunk_ids_due_for_sweep(conn, expires_before, UploadStatus::Uploaded.as_code())
        })?;
        let due = ids.len();

        info!(due, "Starting reconciliation sweep");

        let cancel = self.cancellation();
        let results: Vec<(String, Result<UploadStatus, StorageError>)> = stream::iter(ids)
            .take_while(|_| futures_util::future::ready(!*cancel.borrow()))
            .map(|chunk_id| async move {
                let result = self.reconcile_chunk(&chunk_id).await;
                (chunk_id, result)
            })
            .buffer_unordered(self.repo.config().max_concurrent_reconciliations)
            .collect()
            .await;

        let mut report = SweepReport {
            cancelled: results.len() < due,
            ..SweepReport::default()
        };
        for (chunk_id, result) in results {
            match result {
                Ok(status) => {
                    report.reconciled += 1;
                    match status {
                        UploadStatus::Uploaded => report.uploaded += 1,
                        _ => report.uploading += 1,
                    }
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(chunk_id = %chunk_id, error = %e, "Chunk reconciliation failed");
                    } else {
                        warn!(chunk_id = %chunk_id, error = %e, "Chunk reconciliation failed");
                    }
                    report.failures.push(SweepFailure {
                        chunk_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            reconciled = report.reconciled,
            uploaded = report.uploaded,
            uploading = report.uploading,
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "Reconciliation sweep finished"
        );
        Ok(report)
    }

    /// Process link events and run periodic sweeps until shutdown
    pub async fn run(&mut self, mut events: mpsc::Receiver<LinkEvent>) -> Result<(), StorageError> {
        if let Some(mut shutdown) = self.shutdown.take() {
            let cancel = Arc::clone(&self.cancel);
            tokio::spawn(async move {
                let _ = shutdown.recv().await;
                cancel.send_replace(true);
            });
        }

        let mut stop = self.cancellation();
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.repo.config().sweep_interval_secs.max(1),
        ));
        let mut events_open = true;

        info!(
            interval_secs = self.repo.config().sweep_interval_secs,
            "Reconciler started"
        );

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => {
                            let link_id = event.link_id.clone();
                            if let Err(e) = self.handle_link_event(event).await {
                                warn!(link_id = %link_id, error = %e, "Failed to handle link event");
                            }
                        }
                        None => {
                            debug!("Link event channel closed");
                            events_open = false;
                        }
                    }
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if report.cancelled => break,
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reconciliation sweep failed"),
                    }
                }
            }
        }

        info!("Reconciler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(redundancy: u32, expires: i64) -> Chunk {
        Chunk::build_for_id("c1", redundancy, expires, false)
    }

    fn link(provider: &str, status: LinkStatus, expires: i64) -> StorageLink {
        StorageLink {
            id: format!("l-{}", provider),
            chunk_id: "c1".into(),
            provider_id: provider.into(),
            status,
            expires,
        }
    }

    #[test]
    fn test_under_replicated() {
        let links = vec![
            link("a", LinkStatus::Signed, 1_000),
            link("b", LinkStatus::Signed, 1_000),
        ];
        assert_eq!(
            evaluate_upload(&chunk(3, 500), &links),
            UploadVerdict::UnderReplicated { live: 2, required: 3 }
        );
    }

    #[test]
    fn test_non_live_links_do_not_count() {
        let links = vec![
            link("a", LinkStatus::Signed, 1_000),
            link("b", LinkStatus::Proposed, 1_000),
            link("c", LinkStatus::Rejected, 1_000),
        ];
        assert_eq!(evaluate_upload(&chunk(2, 500), &links).status(), UploadStatus::Uploading);
    }

    #[test]
    fn test_expiring_copy_needs_renewal() {
        let links = vec![
            link("a", LinkStatus::Signed, 1_000),
            link("b", LinkStatus::Signed, 400),
        ];
        let verdict = evaluate_upload(&chunk(2, 500), &links);
        assert!(matches!(verdict, UploadVerdict::Expiring { link_expires: 400, .. }));
        assert_eq!(verdict.status(), UploadStatus::Uploading);
    }

    #[test]
    fn test_redundancy_shortfall_wins_over_expiry() {
        let links = vec![link("a", LinkStatus::Signed, 100)];
        assert!(matches!(
            evaluate_upload(&chunk(2, 500), &links),
            UploadVerdict::UnderReplicated { .. }
        ));
    }

    #[test]
    fn test_replicated() {
        let links = vec![
            link("a", LinkStatus::Signed, 500),
            link("b", LinkStatus::Signed, 900),
        ];
        assert_eq!(evaluate_upload(&chunk(2, 500), &links), UploadVerdict::Replicated);
    }
}
