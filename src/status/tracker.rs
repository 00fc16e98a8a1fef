use rusqlite::Connection;

use super::{DocumentStatus, PartStatus};
use crate::db::Db;
use crate::error::{DocsplitError, Result};
use crate::split::WrittenPart;
use crate::store::parts::PartUpdate;
use crate::store::{documents, parts, Document, DocumentPart};

/// Result fields written together with a document transition
#[derive(Debug, Default, Clone)]
pub struct DocumentUpdate {
    pub content: Option<String>,
    pub error_message: Option<String>,
}

/// Validate and apply a document transition on an open connection.
pub fn apply_document_transition(
    conn: &Connection,
    document_id: &str,
    next: DocumentStatus,
    update: &DocumentUpdate,
) -> Result<Document> {
    let current = documents::require(conn, document_id)?;
    if !current.status.can_transition_to(next) {
        return Err(DocsplitError::InvalidTransition {
            from: current.status.to_string(),
            to: next.to_string(),
        });
    }
    documents::write_status(
        conn,
        document_id,
        next,
        update.content.as_deref(),
        update.error_message.as_deref(),
    )?;
    documents::require(conn, document_id)
}

/// Validate and apply a part transition on an open connection.
pub fn apply_part_transition(
    conn: &Connection,
    part_id: &str,
    next: PartStatus,
    update: &PartUpdate<'_>,
) -> Result<DocumentPart> {
    let current = parts::require(conn, part_id)?;
    if !current.status.can_transition_to(next) {
        return Err(DocsplitError::InvalidTransition {
            from: current.status.to_string(),
            to: next.to_string(),
        });
    }
    parts::write_status(conn, part_id, next, update)?;
    parts::require(conn, part_id)
}

/// Persists validated status changes for documents and parts.
///
/// Every change reads the current status, checks the state machine and writes
/// inside one transaction.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    db: Db,
}

impl StatusTracker {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn transition_document(
        &self,
        document_id: &str,
        next: DocumentStatus,
        update: DocumentUpdate,
    ) -> Result<Document> {
        let id = document_id.to_string();
        let doc = self
            .db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let doc = apply_document_transition(&tx, &id, next, &update)?;
                tx.commit()?;
                Ok(doc)
            })
            .await?;
        log::debug!("Document {} -> {}", doc.id, doc.status);
        Ok(doc)
    }

    /// Move a non-terminal document to ERROR. Returns false when the document
    /// was already terminal or is gone.
    pub async fn fail_document(&self, document_id: &str, message: &str) -> Result<bool> {
        let id = document_id.to_string();
        let message = message.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let current = match documents::get(&tx, &id)? {
                    Some(doc) => doc,
                    None => return Ok(false),
                };
                if current.status.is_terminal() {
                    return Ok(false);
                }
                let update = DocumentUpdate {
                    content: None,
                    error_message: Some(message),
                };
                apply_document_transition(&tx, &id, DocumentStatus::Error, &update)?;
                tx.commit()?;
                Ok(true)
            })
            .await
    }

    /// SPLITTING -> SPLIT together with the part rows and split metadata, in
    /// one transaction so no partial registration is ever visible.
    pub async fn register_parts(
        &self,
        document_id: &str,
        written: Vec<WrittenPart>,
        reason: &str,
        working_area_id: &str,
    ) -> Result<Vec<DocumentPart>> {
        let id = document_id.to_string();
        let reason = reason.to_string();
        let area_id = working_area_id.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                apply_document_transition(&tx, &id, DocumentStatus::Split, &DocumentUpdate::default())?;
                let registered = parts::insert_all(&tx, &id, &written)?;
                documents::mark_split(&tx, &id, written.len() as u32, &reason, &area_id)?;
                tx.commit()?;
                Ok(registered)
            })
            .await
    }

    pub async fn transition_part(
        &self,
        part_id: &str,
        next: PartStatus,
        error_message: Option<String>,
        warning: Option<String>,
        content: Option<String>,
        attempts: Option<u32>,
    ) -> Result<DocumentPart> {
        let id = part_id.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let update = PartUpdate {
                    error_message: error_message.as_deref(),
                    warning: warning.as_deref(),
                    content: content.as_deref(),
                    attempts,
                };
                let part = apply_part_transition(&tx, &id, next, &update)?;
                tx.commit()?;
                Ok(part)
            })
            .await
    }

    /// Last resort when a part's result cannot be written: ERROR without the
    /// state machine, so the part does not stay in flight.
    pub async fn force_part_error(&self, part_id: &str, message: &str) -> Result<bool> {
        let id = part_id.to_string();
        let message = message.to_string();
        self.db
            .with_connection(move |conn| parts::force_error(conn, &id, &message))
            .await
    }

    /// Delete a document and (by cascade) its parts.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let id = document_id.to_string();
        self.db.with_connection(move |conn| documents::delete(conn, &id)).await
    }

    pub async fn document(&self, document_id: &str) -> Result<Option<Document>> {
        let id = document_id.to_string();
        self.db.with_connection(move |conn| documents::get(conn, &id)).await
    }

    pub async fn parts(&self, document_id: &str) -> Result<Vec<DocumentPart>> {
        let id = document_id.to_string();
        self.db
            .with_connection(move |conn| parts::list_for_document(conn, &id))
            .await
    }
}
