use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;

use super::{parse_timestamp, timestamp};
use crate::error::Result;
use crate::split::WorkingArea;

const AREA_COLUMNS: &str = "id, document_id, path, created_at, retention_deadline, deleted_at";

fn map_area(row: &Row<'_>) -> rusqlite::Result<WorkingArea> {
    let deleted_at = match row.get::<_, Option<String>>(5)? {
        Some(_) => Some(parse_timestamp(row, 5)?),
        None => None,
    };
    Ok(WorkingArea {
        id: row.get(0)?,
        document_id: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        created_at: parse_timestamp(row, 3)?,
        retention_deadline: parse_timestamp(row, 4)?,
        deleted_at,
    })
}

pub fn insert(conn: &Connection, area: &WorkingArea) -> Result<()> {
    conn.execute(
        "INSERT INTO working_areas (id, document_id, path, created_at, retention_deadline, deleted_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
        params![
            area.id,
            area.document_id,
            area.path.to_string_lossy().to_string(),
            timestamp(area.created_at),
            timestamp(area.retention_deadline),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<WorkingArea>> {
    let sql = format!("SELECT {} FROM working_areas WHERE id = ?1", AREA_COLUMNS);
    Ok(conn.query_row(&sql, params![id], map_area).optional()?)
}

/// Areas owned by a document that have not been deleted yet
pub fn live_for_document(conn: &Connection, document_id: &str) -> Result<Vec<WorkingArea>> {
    let sql = format!(
        "SELECT {} FROM working_areas WHERE document_id = ?1 AND deleted_at IS NULL ORDER BY created_at",
        AREA_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let areas = stmt
        .query_map(params![document_id], map_area)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(areas)
}

/// Live areas whose retention deadline is at or before `now`
pub fn list_expired(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<WorkingArea>> {
    let sql = format!(
        "SELECT {} FROM working_areas WHERE deleted_at IS NULL AND retention_deadline <= ?1 \
         ORDER BY retention_deadline",
        AREA_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let areas = stmt
        .query_map(params![timestamp(now)], map_area)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(areas)
}

/// Every recorded path, deleted or not
pub fn known_paths(conn: &Connection) -> Result<Vec<PathBuf>> {
    let mut stmt = conn.prepare("SELECT path FROM working_areas")?;
    let paths = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .map(|r| r.map(PathBuf::from))
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(paths)
}

/// Mark the area deleted. Returns false when someone else already claimed it.
pub fn claim_deletion(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE working_areas SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
        params![id, timestamp(now)],
    )?;
    Ok(updated == 1)
}

/// Undo a claim after the directory could not be removed, so a later sweep retries.
pub fn release_claim(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("UPDATE working_areas SET deleted_at = NULL WHERE id = ?1", params![id])?;
    Ok(())
}

/// Pull the retention deadline forward so the next sweep considers the area.
pub fn expire_now(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE working_areas SET retention_deadline = ?2 \
         WHERE id = ?1 AND deleted_at IS NULL AND retention_deadline > ?2",
        params![id, timestamp(now)],
    )?;
    Ok(())
}
