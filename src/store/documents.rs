use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;

use super::{parse_column, parse_timestamp, timestamp, Document};
use crate::error::{DocsplitError, Result};
use crate::status::DocumentStatus;

const DOCUMENT_COLUMNS: &str = "id, original_filename, stored_path, format_class, byte_size, status, \
     is_split, total_parts, split_reason, working_area_id, error_message, processed_content, \
     created_at, updated_at";

fn map_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        original_filename: row.get(1)?,
        stored_path: PathBuf::from(row.get::<_, String>(2)?),
        format_class: parse_column(row, 3)?,
        byte_size: row.get::<_, i64>(4)? as u64,
        status: parse_column(row, 5)?,
        is_split: row.get(6)?,
        total_parts: row.get::<_, Option<i64>>(7)?.map(|n| n as u32),
        split_reason: row.get(8)?,
        working_area_id: row.get(9)?,
        error_message: row.get(10)?,
        processed_content: row.get(11)?,
        created_at: parse_timestamp(row, 12)?,
        updated_at: parse_timestamp(row, 13)?,
    })
}

pub fn insert(conn: &Connection, doc: &Document) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO documents (
            id, original_filename, stored_path, format_class, byte_size, status,
            is_split, total_parts, split_reason, working_area_id, error_message,
            processed_content, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            doc.id,
            doc.original_filename,
            doc.stored_path.to_string_lossy().to_string(),
            doc.format_class.as_str(),
            doc.byte_size as i64,
            doc.status.as_str(),
            doc.is_split,
            doc.total_parts.map(|n| n as i64),
            doc.split_reason,
            doc.working_area_id,
            doc.error_message,
            doc.processed_content,
            timestamp(doc.created_at),
            timestamp(doc.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Document>> {
    let sql = format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS);
    let doc = conn.query_row(&sql, params![id], map_document).optional()?;
    Ok(doc)
}

pub fn require(conn: &Connection, id: &str) -> Result<Document> {
    get(conn, id)?.ok_or_else(|| DocsplitError::DocumentNotFound(id.to_string()))
}

/// Most recently created documents first
pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Document>> {
    let sql = format!(
        "SELECT {} FROM documents ORDER BY created_at DESC LIMIT ?1",
        DOCUMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
        .query_map(params![limit as i64], map_document)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(docs)
}

/// Record the split outcome once every part has been registered.
pub fn mark_split(
    conn: &Connection,
    id: &str,
    total_parts: u32,
    reason: &str,
    working_area_id: &str,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE documents SET is_split = 1, total_parts = ?2, split_reason = ?3, \
         working_area_id = ?4, updated_at = ?5 WHERE id = ?1",
        params![id, total_parts as i64, reason, working_area_id, timestamp(Utc::now())],
    )?;
    if updated == 0 {
        return Err(DocsplitError::DocumentNotFound(id.to_string()));
    }
    Ok(())
}

/// Unconditional status/result write; state machine checks live in the tracker.
pub fn write_status(
    conn: &Connection,
    id: &str,
    status: DocumentStatus,
    content: Option<&str>,
    error_message: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE documents SET status = ?2, processed_content = COALESCE(?3, processed_content), \
         error_message = ?4, updated_at = ?5 WHERE id = ?1",
        params![id, status.as_str(), content, error_message, timestamp(Utc::now())],
    )?;
    Ok(())
}

/// Delete a document; parts go with it via ON DELETE CASCADE.
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

#[cfg(test)]
pub(crate) fn sample(id: &str, status: DocumentStatus) -> Document {
    use crate::format::FormatClass;
    let now = Utc::now();
    Document {
        id: id.to_string(),
        original_filename: "report.txt".to_string(),
        stored_path: PathBuf::from("/tmp/report.txt"),
        format_class: FormatClass::DelimitedText,
        byte_size: 1024,
        status,
        is_split: false,
        total_parts: None,
        split_reason: None,
        working_area_id: None,
        error_message: None,
        processed_content: None,
        created_at: now,
        updated_at: now,
    }
}
