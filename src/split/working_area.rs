use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::Db;
use crate::error::{DocsplitError, Result};
use crate::store::working_areas;

/// Directory name prefix of every working area under the upload folder
pub const WORKING_AREA_PREFIX: &str = "split_";

/// Temporary directory holding the parts of one split document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkingArea {
    pub id: String,
    pub document_id: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub retention_deadline: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Creates and deletes working areas, keeping the database in step with disk.
#[derive(Clone)]
pub struct WorkingAreaManager {
    db: Db,
    root: PathBuf,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl WorkingAreaManager {
    pub fn new(db: Db, root: impl Into<PathBuf>, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            root: root.into(),
            retention,
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Create a fresh, uniquely named area for `document_id` and record it.
    pub async fn allocate(&self, document_id: &str) -> Result<WorkingArea> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.root.join(format!("{}{}", WORKING_AREA_PREFIX, id));
        std::fs::create_dir_all(&path).map_err(|e| {
            DocsplitError::Write(format!("cannot create working area {}: {}", path.display(), e))
        })?;

        let now = self.clock.now();
        let area = WorkingArea {
            id,
            document_id: document_id.to_string(),
            path,
            created_at: now,
            retention_deadline: now + self.retention,
            deleted_at: None,
        };

        let row = area.clone();
        if let Err(e) = self.db.with_connection(move |conn| working_areas::insert(conn, &row)).await {
            let _ = std::fs::remove_dir_all(&area.path);
            return Err(e);
        }

        log::debug!("Allocated working area {} for document {}", area.path.display(), document_id);
        Ok(area)
    }

    /// Delete the area's directory and mark its row deleted.
    ///
    /// Returns false when the area was already deleted (or is unknown). A
    /// directory that has vanished from disk counts as deleted.
    pub async fn release(&self, area_id: &str) -> Result<bool> {
        let id = area_id.to_string();
        let now = self.clock.now();
        let claimed = self
            .db
            .with_connection(move |conn| {
                let area = match working_areas::get(conn, &id)? {
                    Some(area) => area,
                    None => return Ok(None),
                };
                if working_areas::claim_deletion(conn, &id, now)? {
                    Ok(Some(area))
                } else {
                    Ok(None)
                }
            })
            .await?;

        let area = match claimed {
            Some(area) => area,
            None => return Ok(false),
        };

        match std::fs::remove_dir_all(&area.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("Working area {} already gone from disk", area.path.display());
            }
            Err(e) => {
                let id = area.id.clone();
                self.db
                    .with_connection(move |conn| working_areas::release_claim(conn, &id))
                    .await?;
                return Err(DocsplitError::Io(e));
            }
        }

        log::info!("Deleted working area {} (document {})", area.path.display(), area.document_id);
        Ok(true)
    }

    /// Make the area eligible for the next sweep.
    pub async fn expire(&self, area_id: &str) -> Result<()> {
        let id = area_id.to_string();
        let now = self.clock.now();
        self.db
            .with_connection(move |conn| working_areas::expire_now(conn, &id, now))
            .await
    }

    /// Live areas owned by a document
    pub async fn live_for_document(&self, document_id: &str) -> Result<Vec<WorkingArea>> {
        let document_id = document_id.to_string();
        self.db
            .with_connection(move |conn| working_areas::live_for_document(conn, &document_id))
            .await
    }
}
