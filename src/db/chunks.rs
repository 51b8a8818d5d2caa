//! Chunk row operations

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::chunk::Chunk;
use crate::error::StorageError;
use crate::status::StatusFilter;

impl Chunk {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let ul_status: String = row.get("ul_status")?;
        let dl_status: String = row.get("dl_status")?;
        let size: Option<i64> = row.get("size")?;
        let redundancy: i64 = row.get("redundancy")?;

        Ok(Self {
            id: Some(row.get("id")?),
            size: size.map(|s| s as u64),
            upload_status: ul_status.parse()?,
            download_status: dl_status.parse()?,
            redundancy: redundancy as u32,
            expires: row.get("expires")?,
            autorenew: row.get("autorenew")?,
        })
    }
}

/// Chunk policy columns derived from the files that reference it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub redundancy: u32,
    pub expires: i64,
    pub autorenew: bool,
}

/// Get chunk by ID
pub fn get_chunk(conn: &Connection, id: &str) -> Result<Option<Chunk>, StorageError> {
    let mut stmt = conn.prepare("SELECT * FROM chunks WHERE id = ?")?;
    let mut rows = stmt.query(params![id])?;

    match rows.next()? {
        Some(row) => Ok(Some(Chunk::from_row(row)?)),
        None => Ok(None),
    }
}

/// Insert a chunk row unless one already exists. Returns whether a row was inserted.
pub fn insert_chunk_if_absent(conn: &Connection, id: &str, chunk: &Chunk) -> Result<bool, StorageError> {
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO chunks (id, size, ul_status, dl_status, redundancy, expires, autorenew)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            chunk.size.map(|s| s as i64),
            chunk.upload_status.as_code(),
            chunk.download_status.as_code(),
            chunk.redundancy as i64,
            chunk.expires,
            chunk.autorenew,
        ],
    )?;
    Ok(inserted > 0)
}

/// Record that bytes are present locally
pub fn set_chunk_data(conn: &Connection, id: &str, size: u64, dl_status: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE chunks SET size = ?, dl_status = ?, updated_at = datetime('now') WHERE id = ?",
        params![size as i64, dl_status, id],
    )?;
    Ok(())
}

pub fn set_upload_status(conn: &Connection, id: &str, code: &str) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE chunks SET ul_status = ?, updated_at = datetime('now') WHERE id = ?",
        params![code, id],
    )?)
}

pub fn set_download_status(conn: &Connection, id: &str, code: &str) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE chunks SET dl_status = ?, updated_at = datetime('now') WHERE id = ?",
        params![code, id],
    )?)
}

pub fn set_policy(conn: &Connection, id: &str, policy: &ChunkPolicy) -> Result<usize, StorageError> {
    Ok(conn.execute(
        r#"
        UPDATE chunks SET redundancy = ?, expires = ?, autorenew = ?, updated_at = datetime('now')
        WHERE id = ?
        "#,
        params![policy.redundancy as i64, policy.expires, policy.autorenew, id],
    )?)
}

/// Strictest policy across all files referencing a chunk (None if unreferenced)
pub fn strictest_file_policy(conn: &Connection, chunk_id: &str) -> Result<Option<ChunkPolicy>, StorageError> {
    let row: Option<(Option<i64>, Option<i64>, Option<bool>)> = conn
        .query_row(
            r#"
            SELECT MAX(f.redundancy), MAX(f.expires), MAX(f.autorenew)
            FROM files f
            INNER JOIN file_map m ON m.file_id = f.id
            WHERE m.chunk_id = ?
            "#,
            params![chunk_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    Ok(match row {
        Some((Some(redundancy), Some(expires), autorenew)) => Some(ChunkPolicy {
            redundancy: redundancy as u32,
            expires,
            autorenew: autorenew.unwrap_or(false),
        }),
        _ => None,
    })
}

/// All chunks whose upload or download status matches
pub fn chunks_by(conn: &Connection, filter: StatusFilter) -> Result<Vec<Chunk>, StorageError> {
    let sql = format!("SELECT * FROM chunks WHERE {} = ? ORDER BY id", filter.column());
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![filter.code()])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        results.push(Chunk::from_row(row)?);
    }
    Ok(results)
}

/// Every chunk, ordered by id
pub fn list_chunks(conn: &Connection) -> Result<Vec<Chunk>, StorageError> {
    let mut stmt = conn.prepare("SELECT * FROM chunks ORDER BY id")?;
    let mut rows = stmt.query([])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        results.push(Chunk::from_row(row)?);
    }
    Ok(results)
}

/// Chunk ids a sweep should look at: expiring before `expires_before`,
/// or not yet known to be fully uploaded.
pub fn chunk_ids_due_for_sweep(conn: &Connection, expires_before: i64, uploaded_code: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM chunks WHERE expires <= ? OR ul_status != ? ORDER BY expires ASC",
    )?;
    let ids = stmt
        .query_map(params![expires_before, uploaded_code], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Distinct ids of files whose map references this chunk
pub fn owning_file_ids(conn: &Connection, chunk_id: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT file_id FROM file_map WHERE chunk_id = ? ORDER BY file_id",
    )?;
    let ids = stmt
        .query_map(params![chunk_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Number of file map rows referencing a chunk
pub fn reference_count(conn: &Connection, chunk_id: &str) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM file_map WHERE chunk_id = ?",
        params![chunk_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
