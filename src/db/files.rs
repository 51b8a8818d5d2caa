//! File and file map row operations

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StorageError;
use crate::file::File;
use crate::status::{DownloadStatus, StatusFilter, UploadStatus};

impl File {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let ul_status: String = row.get("ul_status")?;
        let dl_status: String = row.get("dl_status")?;
        let size: i64 = row.get("size")?;
        let redundancy: i64 = row.get("redundancy")?;

        Ok(Self {
            id: row.get("id")?,
            original_path: row.get("original_path")?,
            size: size as u64,
            redundancy: redundancy as u32,
            expires: row.get("expires")?,
            autorenew: row.get("autorenew")?,
            upload_status: ul_status.parse()?,
            download_status: dl_status.parse()?,
        })
    }
}

/// One `file_map` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapRow {
    pub file_id: String,
    pub chunk_id: String,
    pub chunk_index: u32,
}

/// Get file by ID
pub fn get_file(conn: &Connection, id: &str) -> Result<Option<File>, StorageError> {
    let mut stmt = conn.prepare("SELECT * FROM files WHERE id = ?")?;
    let mut rows = stmt.query(params![id])?;

    match rows.next()? {
        Some(row) => Ok(Some(File::from_row(row)?)),
        None => Ok(None),
    }
}

/// Insert a file row unless one already exists. Returns whether a row was inserted.
pub fn insert_file_if_absent(conn: &Connection, file: &File) -> Result<bool, StorageError> {
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO files (
            id, original_path, size, ul_status, dl_status, redundancy, expires, autorenew
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            file.id,
            file.original_path,
            file.size as i64,
            file.upload_status.as_code(),
            file.download_status.as_code(),
            file.redundancy as i64,
            file.expires,
            file.autorenew,
        ],
    )?;
    Ok(inserted > 0)
}

pub fn set_policy(conn: &Connection, id: &str, redundancy: u32, expires: i64, autorenew: bool) -> Result<usize, StorageError> {
    Ok(conn.execute(
        r#"
        UPDATE files SET redundancy = ?, expires = ?, autorenew = ?, updated_at = datetime('now')
        WHERE id = ?
        "#,
        params![redundancy as i64, expires, autorenew, id],
    )?)
}

pub fn set_upload_status(conn: &Connection, id: &str, code: &str) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE files SET ul_status = ?, updated_at = datetime('now') WHERE id = ?",
        params![code, id],
    )?)
}

pub fn set_download_status(conn: &Connection, id: &str, code: &str) -> Result<usize, StorageError> {
    Ok(conn.execute(
        "UPDATE files SET dl_status = ?, updated_at = datetime('now') WHERE id = ?",
        params![code, id],
    )?)
}

/// All files whose upload or download status matches
pub fn files_by(conn: &Connection, filter: StatusFilter) -> Result<Vec<File>, StorageError> {
    let sql = format!("SELECT * FROM files WHERE {} = ? ORDER BY id", filter.column());
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![filter.code()])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        results.push(File::from_row(row)?);
    }
    Ok(results)
}

/// Bind a chunk to a file position.
///
/// Re-binding the same chunk at the same position is a no-op; binding a
/// different chunk to an occupied position is rejected.
pub fn insert_map_row(conn: &Connection, file_id: &str, chunk_id: &str, chunk_index: u32) -> Result<(), StorageError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT chunk_id FROM file_map WHERE file_id = ? AND chunk_index = ?",
            params![file_id, chunk_index as i64],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(ref bound) if bound == chunk_id => Ok(()),
        Some(bound) => Err(StorageError::InvalidInput(format!(
            "File {} already maps index {} to chunk {}",
            file_id, chunk_index, bound
        ))),
        None => {
            conn.execute(
                "INSERT INTO file_map (file_id, chunk_id, chunk_index) VALUES (?, ?, ?)",
                params![file_id, chunk_id, chunk_index as i64],
            )?;
            Ok(())
        }
    }
}

/// Map rows for a file in index order
pub fn map_rows(conn: &Connection, file_id: &str) -> Result<Vec<FileMapRow>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT file_id, chunk_id, chunk_index FROM file_map WHERE file_id = ? ORDER BY chunk_index ASC",
    )?;
    let rows = stmt
        .query_map(params![file_id], |row| {
            let index: i64 = row.get(2)?;
            Ok(FileMapRow {
                file_id: row.get(0)?,
                chunk_id: row.get(1)?,
                chunk_index: index as u32,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Stored statuses of the chunks a file references, one entry per map row.
/// Map rows whose chunk has no metadata row yet come back as `None`.
pub fn chunk_statuses(
    conn: &Connection,
    file_id: &str,
) -> Result<Vec<Option<(UploadStatus, DownloadStatus)>>, StorageError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT c.ul_status, c.dl_status
        FROM file_map m
        LEFT JOIN chunks c ON c.id = m.chunk_id
        WHERE m.file_id = ?
        ORDER BY m.chunk_index ASC
        "#,
    )?;
    let raw = stmt
        .query_map(params![file_id], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(ul, dl)| -> Result<Option<(UploadStatus, DownloadStatus)>, StorageError> {
            match (ul, dl) {
                (Some(ul), Some(dl)) => Ok(Some((ul.parse()?, dl.parse()?))),
                _ => Ok(None),
            }
        })
        .collect()
}

/// Delete a file and its map rows, then drop chunk rows (and their links)
/// no longer referenced by any file. Returns the ids of the dropped chunks.
pub fn delete_file(conn: &mut Connection, file_id: &str) -> Result<Vec<String>, StorageError> {
    let tx = conn.transaction()?;

    let chunk_ids: Vec<String> = {
        let mut stmt = tx.prepare("SELECT DISTINCT chunk_id FROM file_map WHERE file_id = ?")?;
        let ids = stmt
            .query_map(params![file_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        ids
    };

    tx.execute("DELETE FROM file_map WHERE file_id = ?", params![file_id])?;
    let deleted = tx.execute("DELETE FROM files WHERE id = ?", params![file_id])?;
    if deleted == 0 {
        return Err(StorageError::NotFound(file_id.to_string()));
    }

    let mut orphaned = Vec::new();
    for chunk_id in chunk_ids {
        if super::chunks::reference_count(&tx, &chunk_id)? == 0 {
            tx.execute("DELETE FROM storage_links WHERE chunk_id = ?", params![chunk_id])?;
            tx.execute("DELETE FROM chunks WHERE id = ?", params![chunk_id])?;
            orphaned.push(chunk_id);
        }
    }

    tx.commit()?;
    Ok(orphaned)
}

/// Every file, ordered by id, with its chunk count
pub fn list_files_with_counts(conn: &Connection) -> Result<Vec<(File, u64)>, StorageError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT f.*, (SELECT COUNT(*) FROM file_map m WHERE m.file_id = f.id) AS chunk_count
        FROM files f
        ORDER BY f.id
        "#,
    )?;
    let mut rows = stmt.query([])?;

    let mut results = vec![];
    while let Some(row) = rows.next()? {
        let count: i64 = row.get("chunk_count")?;
        results.push((File::from_row(row)?, count as u64));
    }
    Ok(results)
}
