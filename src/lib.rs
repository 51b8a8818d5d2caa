//! Elohim Chunks - Content-addressed chunk storage with redundancy tracking
//!
//! Blobs are split into fixed-size chunks named by the SHA256 of their bytes.
//! Files are ordered sequences of chunks, and chunks shared between files are
//! stored once. Each chunk tracks the replication agreements (storage links)
//! other providers hold for it, and is only considered uploaded once enough
//! of them are live for long enough.
//!
//! ## Architecture
//!
//! - **ContentStore**: chunk bytes on the local filesystem
//! - **MetadataDb**: chunks, files, file map and storage links in SQLite
//! - **Reconciler**: recomputes upload/download statuses on ingest, on
//!   link-status events and on periodic sweeps
//!
//! Networking is out of scope. Replication requests go through the
//! `ReplicationTransport` trait and come back as `LinkEvent`s.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/elohim-chunks/
//! ├── cache/                 # Content-addressed chunk bytes
//! │   ├── 9f/
//! │   │   └── chunk_9f86d0...  # First 2 chars of hash as subdirs
//! │   └── ...
//! ├── metadata.db            # SQLite: chunks, files, file_map, storage_links
//! └── config.toml            # Configuration
//! ```

pub mod chunk;
pub mod config;
pub mod content_store;
pub mod db;
pub mod error;
pub mod file;
pub mod locks;
pub mod reconcile;
pub mod repository;
pub mod status;
pub mod storage_link;

// Re-exports
pub use chunk::Chunk;
pub use config::Config;
pub use content_store::ContentStore;
pub use db::MetadataDb;
pub use error::StorageError;
pub use file::{File, StoreOptions};
pub use reconcile::{
    LinkEvent, NoRenewal, NullTransport, Reconciler, RenewalPolicy, ReplicaOffer,
    ReplicationTransport, SweepReport, UploadVerdict,
};
pub use repository::{ChunkSummary, FileSummary, Repository};
pub use status::{Cascade, DownloadStatus, LinkStatus, StatusFilter, UploadStatus};
pub use storage_link::StorageLink;
