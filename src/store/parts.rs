use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use uuid::Uuid;

use super::{parse_column, parse_timestamp, timestamp, DocumentPart};
use crate::error::{DocsplitError, Result};
use crate::split::WrittenPart;
use crate::status::PartStatus;

const PART_COLUMNS: &str = "id, document_id, sequence_index, total_parts, file_path, byte_size, \
     status, error_message, warning, content, attempts, created_at, updated_at";

fn map_part(row: &Row<'_>) -> rusqlite::Result<DocumentPart> {
    Ok(DocumentPart {
        id: row.get(0)?,
        document_id: row.get(1)?,
        sequence_index: row.get::<_, i64>(2)? as u32,
        total_parts: row.get::<_, i64>(3)? as u32,
        file_path: PathBuf::from(row.get::<_, String>(4)?),
        byte_size: row.get::<_, i64>(5)? as u64,
        status: parse_column(row, 6)?,
        error_message: row.get(7)?,
        warning: row.get(8)?,
        content: row.get(9)?,
        attempts: row.get::<_, i64>(10)? as u32,
        created_at: parse_timestamp(row, 11)?,
        updated_at: parse_timestamp(row, 12)?,
    })
}

/// Register finished part files as PENDING rows, in sequence order.
///
/// Callers run this inside the transaction that also marks the parent split,
/// so either every part is registered or none is.
pub fn insert_all(conn: &Connection, document_id: &str, written: &[WrittenPart]) -> Result<Vec<DocumentPart>> {
    let now = Utc::now();
    let mut stmt = conn.prepare(
        r#"
        INSERT INTO document_parts (
            id, document_id, sequence_index, total_parts, file_path, byte_size,
            status, attempts, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
        "#,
    )?;

    let mut parts = Vec::with_capacity(written.len());
    for part in written {
        let id = Uuid::new_v4().to_string();
        stmt.execute(params![
            id,
            document_id,
            part.sequence_index as i64,
            part.total_parts as i64,
            part.path.to_string_lossy().to_string(),
            part.byte_size as i64,
            PartStatus::Pending.as_str(),
            timestamp(now),
        ])?;
        parts.push(DocumentPart {
            id,
            document_id: document_id.to_string(),
            sequence_index: part.sequence_index,
            total_parts: part.total_parts,
            file_path: part.path.clone(),
            byte_size: part.byte_size,
            status: PartStatus::Pending,
            error_message: None,
            warning: None,
            content: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        });
    }
    Ok(parts)
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<DocumentPart>> {
    let sql = format!("SELECT {} FROM document_parts WHERE id = ?1", PART_COLUMNS);
    Ok(conn.query_row(&sql, params![id], map_part).optional()?)
}

pub fn require(conn: &Connection, id: &str) -> Result<DocumentPart> {
    get(conn, id)?.ok_or_else(|| DocsplitError::PartNotFound(id.to_string()))
}

/// Parts of a document ordered by sequence index
pub fn list_for_document(conn: &Connection, document_id: &str) -> Result<Vec<DocumentPart>> {
    let sql = format!(
        "SELECT {} FROM document_parts WHERE document_id = ?1 ORDER BY sequence_index",
        PART_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let parts = stmt
        .query_map(params![document_id], map_part)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(parts)
}

/// Number of PENDING or PROCESSING parts
pub fn count_in_flight(conn: &Connection, document_id: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM document_parts WHERE document_id = ?1 AND status IN (?2, ?3)",
        params![document_id, PartStatus::Pending.as_str(), PartStatus::Processing.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Fields written when a part changes status
#[derive(Debug, Default)]
pub struct PartUpdate<'a> {
    pub error_message: Option<&'a str>,
    pub warning: Option<&'a str>,
    pub content: Option<&'a str>,
    pub attempts: Option<u32>,
}

/// Unconditional write; the tracker validates the transition first.
pub fn write_status(conn: &Connection, id: &str, status: PartStatus, update: &PartUpdate<'_>) -> Result<()> {
    conn.execute(
        "UPDATE document_parts SET status = ?2, error_message = ?3, warning = ?4, \
         content = COALESCE(?5, content), attempts = COALESCE(?6, attempts), updated_at = ?7 \
         WHERE id = ?1",
        params![
            id,
            status.as_str(),
            update.error_message,
            update.warning,
            update.content,
            update.attempts.map(|n| n as i64),
            timestamp(Utc::now()),
        ],
    )?;
    Ok(())
}

/// Move a PENDING or PROCESSING part straight to ERROR, bypassing the
/// transition checks. Returns false when the part is gone or already terminal.
pub fn force_error(conn: &Connection, id: &str, message: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE document_parts SET status = ?2, error_message = ?3, updated_at = ?4 \
         WHERE id = ?1 AND status IN (?5, ?6)",
        params![
            id,
            PartStatus::Error.as_str(),
            message,
            timestamp(Utc::now()),
            PartStatus::Pending.as_str(),
            PartStatus::Processing.as_str(),
        ],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::DocumentStatus;
    use crate::store::documents;
    use crate::store::test_support::setup_test_db;

    fn written(n: u32) -> Vec<WrittenPart> {
        (1..=n)
            .map(|i| WrittenPart {
                sequence_index: i,
                total_parts: n,
                path: PathBuf::from(format!("/tmp/split_x/report_part{}of{}.txt", i, n)),
                byte_size: 100,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_insert_all_in_order() {
        let (db, _temp_dir) = setup_test_db().await;

        db.with_connection(|conn| {
            documents::insert(conn, &documents::sample("doc-1", DocumentStatus::Splitting))?;
            let inserted = insert_all(conn, "doc-1", &written(3))?;
            assert_eq!(inserted.len(), 3);

            let parts = list_for_document(conn, "doc-1")?;
            let indices: Vec<u32> = parts.iter().map(|p| p.sequence_index).collect();
            assert_eq!(indices, vec![1, 2, 3]);
            assert!(parts.iter().all(|p| p.status == PartStatus::Pending && p.total_parts == 3));
            assert_eq!(count_in_flight(conn, "doc-1")?, 3);
            Ok(())
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let (db, _temp_dir) = setup_test_db().await;

        db.with_connection(|conn| {
            documents::insert(conn, &documents::sample("doc-1", DocumentStatus::Splitting))?;
            insert_all(conn, "doc-1", &written(2))?;
            assert!(insert_all(conn, "doc-1", &written(2)).is_err());
            Ok(())
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_status_and_cascade() {
        let (db, _temp_dir) = setup_test_db().await;

        db.with_connection(|conn| {
            documents::insert(conn, &documents::sample("doc-1", DocumentStatus::Split))?;
            let parts = insert_all(conn, "doc-1", &written(2))?;

            write_status(conn, &parts[0].id, PartStatus::Completed, &PartUpdate {
                content: Some("hello"),
                attempts: Some(1),
                ..Default::default()
            })?;
            let part = require(conn, &parts[0].id)?;
            assert_eq!(part.status, PartStatus::Completed);
            assert_eq!(part.content.as_deref(), Some("hello"));
            assert_eq!(part.attempts, 1);
            assert_eq!(count_in_flight(conn, "doc-1")?, 1);

            documents::delete(conn, "doc-1")?;
            assert!(list_for_document(conn, "doc-1")?.is_empty());
            Ok(())
        }).await.unwrap();
    }
}
