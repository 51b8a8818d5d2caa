//! Storage link row operations

use rusqlite::{params, Connection, Row};

use crate::error::StorageError;
use crate::status::LinkStatus;
use crate::storage_link::StorageLink;

impl StorageLink {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let status: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            chunk_id: row.get("chunk_id")?,
            provider_id: row.get("provider_id")?,
            status: status.parse()?,
            expires: row.get("expires")?,
        })
    }
}

pub fn insert_link(conn: &Connection, link: &StorageLink) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO storage_links (id, chunk_id, provider_id, status, expires)
        VALUES (?, ?, ?, ?, ?)
        "#,
        params![
            link.id,
            link.chunk_id,
            link.provider_id,
            link.status.as_str(),
            link.expires,
        ],
    )?;
    Ok(())
}

pub fn get_link(conn: &Connection, id: &str) -> Result<Option<StorageLink>, StorageError> {
    let mut stmt = conn.prepare("SELECT * FROM storage_links WHERE id = ?")?;
    let mut rows = stmt.query(params![id])?;

    match rows.next()? {
        Some(row) => Ok(Some(StorageLink::from_row(row)?)),
        None => Ok(None),
    }
}

/// Links for one chunk in one status. No ordering is implied.
pub fn links_by_status(conn: &Connection, chunk_id: &str, status: LinkStatus) -> Result<Vec<StorageLink>, StorageError> {
    let mut stmt = conn.prepare("SELECT * FROM storage_links WHERE chunk_id = ? AND status = ?")?;
    let mut rows = stmt.query(params![chunk_id, status.as_str()])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        results.push(StorageLink::from_row(row)?);
    }
    Ok(results)
}

pub fn set_status(conn: &Connection, id: &str, status: LinkStatus) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE storage_links SET status = ?, updated_at = datetime('now') WHERE id = ?",
        params![status.as_str(), id],
    )?)
}

pub fn set_expires(conn: &Connection, id: &str, expires: i64) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE storage_links SET expires = ?, updated_at = datetime('now') WHERE id = ?",
        params![expires, id],
    )?)
}

/// Status and end time in one transaction
pub fn set_status_and_expires(
    conn: &mut Connection,
    id: &str,
    status: LinkStatus,
    expires: i64,
) -> Result<(), StorageError> {
    let tx = conn.transaction()?;
    set_status(&tx, id, status)?;
    set_expires(&tx, id, expires)?;
    tx.commit()?;
    Ok(())
}
