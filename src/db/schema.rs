//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new metadata schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Metadata schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(CHUNKS_SCHEMA)?;
    conn.execute_batch(FILES_SCHEMA)?;
    conn.execute_batch(LINKS_SCHEMA)?;
    conn.execute_batch(INDEXES_SCHEMA)?;
    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StorageError> {
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Chunk metadata. Bytes live in the content store under `id`.
const CHUNKS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY NOT NULL,
    size INTEGER,

    ul_status TEXT NOT NULL DEFAULT 'us0',
    dl_status TEXT NOT NULL DEFAULT 'ds0',

    redundancy INTEGER NOT NULL,
    expires INTEGER NOT NULL,
    autorenew INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Files and their ordered chunk map
const FILES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY NOT NULL,
    original_path TEXT,
    size INTEGER NOT NULL,

    ul_status TEXT NOT NULL DEFAULT 'us0',
    dl_status TEXT NOT NULL DEFAULT 'ds0',

    redundancy INTEGER NOT NULL,
    expires INTEGER NOT NULL,
    autorenew INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per position; the same chunk may appear at many positions
-- NOTE: no FK on chunk_id, map rows may be written before the chunk row
CREATE TABLE IF NOT EXISTS file_map (
    file_id TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    PRIMARY KEY (file_id, chunk_index)
);
"#;

/// Replication agreements, one row per (chunk, provider, attempt)
const LINKS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storage_links (
    id TEXT PRIMARY KEY NOT NULL,
    chunk_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'proposed',
    expires INTEGER NOT NULL,

    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_chunks_ul_status ON chunks(ul_status);
CREATE INDEX IF NOT EXISTS idx_chunks_dl_status ON chunks(dl_status);
CREATE INDEX IF NOT EXISTS idx_chunks_expires ON chunks(expires);

CREATE INDEX IF NOT EXISTS idx_files_ul_status ON files(ul_status);
CREATE INDEX IF NOT EXISTS idx_files_dl_status ON files(dl_status);

CREATE INDEX IF NOT EXISTS idx_file_map_chunk_id ON file_map(chunk_id);

CREATE INDEX IF NOT EXISTS idx_links_chunk_status ON storage_links(chunk_id, status);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
