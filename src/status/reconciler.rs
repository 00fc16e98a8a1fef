use serde_json::Value;

use super::tracker::{apply_document_transition, DocumentUpdate};
use super::{DocumentStatus, PartStatus};
use crate::config::ProcessingConfig;
use crate::db::Db;
use crate::error::{DocsplitError, Result};
use crate::process::Conversion;
use crate::split::WorkingAreaManager;
use crate::store::{documents, parts, DocumentPart};

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Finalized {
        status: DocumentStatus,
        working_area_released: bool,
    },
    /// Parent was already terminal; nothing written
    AlreadyTerminal(DocumentStatus),
    /// Parent was deleted while parts were running
    DocumentMissing,
    /// Some parts are still PENDING or PROCESSING
    NotReady { in_flight: usize },
}

/// Parent status and result derived from part statuses
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: DocumentStatus,
    pub content: Option<String>,
    pub error_message: Option<String>,
}

fn join_indices<'a>(parts: impl Iterator<Item = &'a DocumentPart>) -> String {
    parts
        .map(|p| p.sequence_index.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Merge part contents in order: JSON arrays are concatenated into one array,
/// plain text is joined with a blank line. A mix of both is an error.
pub fn assemble_content(contents: &[&str]) -> Result<Option<String>> {
    if contents.is_empty() {
        return Ok(None);
    }

    let arrays: Vec<Option<Vec<Value>>> = contents
        .iter()
        .map(|c| serde_json::from_str::<Vec<Value>>(c).ok())
        .collect();
    let json_count = arrays.iter().filter(|a| a.is_some()).count();

    if json_count == contents.len() {
        let merged: Vec<Value> = arrays.into_iter().flatten().flatten().collect();
        let text = serde_json::to_string(&merged)
            .map_err(|e| DocsplitError::Aggregation(format!("cannot serialize merged records: {}", e)))?;
        return Ok(Some(text));
    }
    if json_count > 0 {
        return Err(DocsplitError::Aggregation(format!(
            "{} of {} part results are JSON arrays, the rest are text",
            json_count,
            contents.len()
        )));
    }
    Ok(Some(contents.join("\n\n")))
}

/// Decide the parent's terminal status from its (terminal) parts.
pub fn decide(parts: &[DocumentPart], error_ratio_threshold: f64) -> Verdict {
    let total = parts.len();
    let failed: Vec<&DocumentPart> = parts.iter().filter(|p| p.status == PartStatus::Error).collect();
    let completed: Vec<&str> = parts
        .iter()
        .filter(|p| p.status == PartStatus::Completed)
        .filter_map(|p| p.content.as_deref())
        .collect();

    let ratio = if total == 0 { 1.0 } else { failed.len() as f64 / total as f64 };
    if ratio > error_ratio_threshold {
        return Verdict {
            status: DocumentStatus::Error,
            content: None,
            error_message: Some(format!(
                "{} of {} parts failed: {}",
                failed.len(),
                total,
                join_indices(failed.iter().copied())
            )),
        };
    }

    let content = match assemble_content(&completed) {
        Ok(content) => content,
        Err(e) => {
            return Verdict {
                status: DocumentStatus::Error,
                content: None,
                error_message: Some(e.to_string()),
            }
        }
    };

    if !failed.is_empty() {
        return Verdict {
            status: DocumentStatus::Incomplete,
            content,
            error_message: Some(format!("failed parts: {}", join_indices(failed.iter().copied()))),
        };
    }

    let warned: Vec<&DocumentPart> = parts.iter().filter(|p| p.warning.is_some()).collect();
    if !warned.is_empty() {
        return Verdict {
            status: DocumentStatus::Warning,
            content,
            error_message: Some(format!("warnings in parts: {}", join_indices(warned.into_iter()))),
        };
    }

    Verdict {
        status: DocumentStatus::Completed,
        content,
        error_message: None,
    }
}

/// Status for a document converted whole
pub fn decide_atomic(conversion: &Conversion) -> Verdict {
    match (&conversion.content, &conversion.error) {
        (Some(content), None) => Verdict {
            status: DocumentStatus::Completed,
            content: Some(content.clone()),
            error_message: None,
        },
        (Some(content), Some(error)) => Verdict {
            status: DocumentStatus::Warning,
            content: Some(content.clone()),
            error_message: Some(error.clone()),
        },
        (None, error) => Verdict {
            status: DocumentStatus::Error,
            content: None,
            error_message: Some(error.clone().unwrap_or_else(|| "converter returned no content".to_string())),
        },
    }
}

/// Finalizes a document once all of its work has finished.
#[derive(Clone)]
pub struct Reconciler {
    db: Db,
    error_ratio_threshold: f64,
    cleanup_on_completion: bool,
    areas: WorkingAreaManager,
}

impl Reconciler {
    pub fn new(db: Db, config: &ProcessingConfig, areas: WorkingAreaManager) -> Self {
        Self {
            db,
            error_ratio_threshold: config.error_ratio_threshold,
            cleanup_on_completion: config.cleanup_on_completion,
            areas,
        }
    }

    /// Aggregate a split document's parts into its terminal status.
    pub async fn reconcile(&self, document_id: &str) -> Result<ReconcileOutcome> {
        let id = document_id.to_string();
        let threshold = self.error_ratio_threshold;
        let outcome = self
            .db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let doc = match documents::get(&tx, &id)? {
                    Some(doc) => doc,
                    None => return Ok((ReconcileOutcome::DocumentMissing, None)),
                };
                if doc.status.is_terminal() {
                    return Ok((ReconcileOutcome::AlreadyTerminal(doc.status), None));
                }

                let doc_parts = parts::list_for_document(&tx, &id)?;
                let in_flight = doc_parts.iter().filter(|p| p.status.is_in_flight()).count();
                if in_flight > 0 {
                    return Ok((ReconcileOutcome::NotReady { in_flight }, None));
                }

                let verdict = decide(&doc_parts, threshold);
                let update = DocumentUpdate {
                    content: verdict.content,
                    error_message: verdict.error_message,
                };
                let finalized = apply_document_transition(&tx, &id, verdict.status, &update)?;
                tx.commit()?;
                Ok((
                    ReconcileOutcome::Finalized {
                        status: finalized.status,
                        working_area_released: false,
                    },
                    finalized.working_area_id,
                ))
            })
            .await?;

        match outcome {
            (ReconcileOutcome::Finalized { status, .. }, area_id) => {
                log::info!("Document {} finalized as {}", document_id, status);
                let working_area_released = match area_id {
                    Some(area_id) if self.cleanup_on_completion => self.release_area(&area_id).await,
                    _ => false,
                };
                Ok(ReconcileOutcome::Finalized {
                    status,
                    working_area_released,
                })
            }
            (ReconcileOutcome::DocumentMissing, _) => {
                log::debug!("Document {} deleted before reconciliation", document_id);
                Ok(ReconcileOutcome::DocumentMissing)
            }
            (other, _) => Ok(other),
        }
    }

    /// Copy a whole-document conversion into the document.
    pub async fn finalize_atomic(&self, document_id: &str, conversion: Conversion) -> Result<ReconcileOutcome> {
        let id = document_id.to_string();
        let verdict = decide_atomic(&conversion);
        let outcome = self
            .db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let doc = match documents::get(&tx, &id)? {
                    Some(doc) => doc,
                    None => return Ok(ReconcileOutcome::DocumentMissing),
                };
                if doc.status.is_terminal() {
                    return Ok(ReconcileOutcome::AlreadyTerminal(doc.status));
                }
                let update = DocumentUpdate {
                    content: verdict.content,
                    error_message: verdict.error_message,
                };
                let finalized = apply_document_transition(&tx, &id, verdict.status, &update)?;
                tx.commit()?;
                Ok(ReconcileOutcome::Finalized {
                    status: finalized.status,
                    working_area_released: false,
                })
            })
            .await?;

        if let ReconcileOutcome::Finalized { status, .. } = &outcome {
            log::info!("Document {} finalized as {}", document_id, status);
        }
        Ok(outcome)
    }

    /// Failures are left for the janitor.
    async fn release_area(&self, area_id: &str) -> bool {
        match self.areas.release(area_id).await {
            Ok(released) => released,
            Err(e) => {
                log::warn!("Failed to release working area {}: {} (janitor will retry)", area_id, e);
                false
            }
        }
    }
}
