//! SQLite metadata store for chunks, files, the file map and storage links
//!
//! ## Architecture
//!
//! - Chunk bytes are stored in the content store (content-addressed)
//! - Everything else is a row here: lifecycle statuses, policies, ordering
//!   and replication agreements
//!
//! ## Tables
//!
//! - `chunks` - one row per content hash
//! - `files` - named blobs
//! - `file_map` - `(file_id, chunk_index) -> chunk_id`
//! - `storage_links` - one row per replication agreement

pub mod schema;
pub mod chunks;
pub mod files;
pub mod links;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::StorageError;

/// SQLite database for chunk/file/link metadata
pub struct MetadataDb {
    conn: Mutex<Connection>,
}

impl MetadataDb {
    /// Open or create the metadata database
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        info!("Opening metadata database at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // WAL for concurrent readers alongside the reconciler
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory metadata database");

        let conn = Connection::open_in_memory()?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| schema::init_schema(conn))
    }

    /// Run a read (or single-statement write) against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            let chunk_count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
            let chunk_bytes: i64 = conn.query_row(
                "SELECT COALESCE(SUM(size), 0) FROM chunks",
                [],
                |row| row.get(0),
            )?;
            let file_count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
            let link_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM storage_links", [], |row| row.get(0))?;

            Ok(DbStats {
                chunk_count: chunk_count as u64,
                chunk_bytes: chunk_bytes as u64,
                file_count: file_count as u64,
                link_count: link_count as u64,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub chunk_count: u64,
    pub chunk_bytes: u64,
    pub file_count: u64,
    pub link_count: u64,
}

/// Current time in unix milliseconds, the unit every `expires` column uses
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
