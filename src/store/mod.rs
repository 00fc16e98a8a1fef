//! SQLite persistence for documents, parts and working areas.
//!
//! Functions take a `&Connection` so they compose inside a transaction; async
//! callers go through `Db::with_connection`.

pub mod documents;
pub mod parts;
pub mod working_areas;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::DocsplitError;
use crate::format::FormatClass;
use crate::status::{DocumentStatus, PartStatus};

/// A logical unit of work: one uploaded file
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub original_filename: String,
    pub stored_path: PathBuf,
    pub format_class: FormatClass,
    pub byte_size: u64,
    pub status: DocumentStatus,
    pub is_split: bool,
    pub total_parts: Option<u32>,
    pub split_reason: Option<String>,
    pub working_area_id: Option<String>,
    pub error_message: Option<String>,
    pub processed_content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A physical slice of a split document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentPart {
    pub id: String,
    pub document_id: String,
    /// 1-based, contiguous
    pub sequence_index: u32,
    pub total_parts: u32,
    pub file_path: PathBuf,
    pub byte_size: u64,
    pub status: PartStatus,
    pub error_message: Option<String>,
    /// Converter returned content together with an error
    pub warning: Option<String>,
    pub content: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fixed-width UTC timestamps so that SQL string comparison orders them.
pub fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = DocsplitError>,
{
    let text: String = row.get(idx)?;
    text.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::db::Db;
    use std::path::Path;
    use tempfile::TempDir;

    /// Fresh migrated database in a temp dir
    pub async fn setup_test_db() -> (Db, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        db.migrate(&migrations_dir).await.unwrap();
        (db, temp_dir)
    }
}
