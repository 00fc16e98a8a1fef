//! Entry points tying classification, splitting, processing and cleanup
//! together.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Db;
use crate::error::{DocsplitError, Result};
use crate::format::FormatClass;
use crate::janitor::Janitor;
use crate::process::{Converter, ProcessingHandle, WorkerPool};
use crate::split::{plan_split, PartWriter, SizeClassifier, SplitReason, SplitStrategy, SplitVerdict, WorkingAreaManager};
use crate::status::tracker::DocumentUpdate;
use crate::status::{CancelFlags, DocumentStatus, OutstandingParts, Reconciler, StatusTracker};
use crate::store::{documents, parts, Document, DocumentPart};

/// Result of classifying and (possibly) splitting a document
#[derive(Debug, Clone, Serialize)]
pub struct SplitOutcome {
    pub should_split: bool,
    pub working_area_path: Option<PathBuf>,
    /// Registered parts in sequence order; empty when the document stays whole
    pub parts: Vec<DocumentPart>,
    pub reason: Option<SplitReason>,
    /// Probe failure or single-part fallback that left the document whole
    pub warning: Option<String>,
}

impl SplitOutcome {
    fn atomic(warning: Option<String>) -> Self {
        Self {
            should_split: false,
            working_area_path: None,
            parts: Vec::new(),
            reason: None,
            warning,
        }
    }
}

/// Document with its parts in sequence order
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatusReport {
    pub document: Document,
    pub parts: Vec<DocumentPart>,
    /// Units still being processed in this process
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    /// Working areas deleted now
    Deleted { areas: usize },
    /// Work still in flight; areas expired so the next sweep reclaims them
    Deferred { areas: usize },
    NothingToClean,
}

/// Everything `ingest` started for one file
#[derive(Debug)]
pub struct Ingestion {
    pub document_id: String,
    pub split: SplitOutcome,
    pub handle: ProcessingHandle,
}

pub struct Pipeline {
    config: Config,
    db: Db,
    classifier: SizeClassifier,
    writer: PartWriter,
    areas: WorkingAreaManager,
    tracker: StatusTracker,
    pool: WorkerPool,
    outstanding: OutstandingParts,
    cancel_flags: CancelFlags,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(config: Config, db: Db, converter: Arc<dyn Converter>) -> Self {
        Self::with_clock(config, db, converter, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, db: Db, converter: Arc<dyn Converter>, clock: Arc<dyn Clock>) -> Self {
        let areas = WorkingAreaManager::new(
            db.clone(),
            config.upload_folder(),
            config.janitor.retention(),
            clock.clone(),
        );
        let tracker = StatusTracker::new(db.clone());
        let reconciler = Reconciler::new(db.clone(), &config.processing, areas.clone());
        let outstanding = OutstandingParts::new();
        let cancel_flags = CancelFlags::new();
        let pool = WorkerPool::new(
            &config.processing,
            converter,
            tracker.clone(),
            reconciler,
            areas.clone(),
            outstanding.clone(),
            cancel_flags.clone(),
        );

        Self {
            classifier: SizeClassifier::new(config.splitting.clone()),
            writer: PartWriter::new(config.splitting.clone()),
            config,
            db,
            areas,
            tracker,
            pool,
            outstanding,
            cancel_flags,
            clock,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Janitor sharing this pipeline's in-flight view
    pub fn janitor(&self) -> Janitor {
        Janitor::new(
            self.db.clone(),
            self.areas.clone(),
            self.outstanding.clone(),
            self.clock.clone(),
        )
    }

    /// Record an uploaded file as a PENDING document.
    pub async fn register_upload(&self, path: &Path, original_filename: &str) -> Result<Document> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(DocsplitError::InvalidInput(format!("{} is not a file", path.display())));
        }

        let now = self.clock.now();
        let document = Document {
            id: uuid::Uuid::new_v4().to_string(),
            original_filename: original_filename.to_string(),
            stored_path: path.to_path_buf(),
            format_class: FormatClass::from_path(Path::new(original_filename)),
            byte_size: metadata.len(),
            status: DocumentStatus::Pending,
            is_split: false,
            total_parts: None,
            split_reason: None,
            working_area_id: None,
            error_message: None,
            processed_content: None,
            created_at: now,
            updated_at: now,
        };

        let row = document.clone();
        self.db.with_connection(move |conn| documents::insert(conn, &row)).await?;
        log::info!(
            "Registered {} as {} ({}, {} bytes)",
            original_filename,
            document.id,
            document.format_class,
            document.byte_size
        );
        Ok(document)
    }

    /// Classify a PENDING document and, when it is too large, split it into
    /// registered parts. Leaves the document SPLIT or PROCESSING.
    pub async fn plan_and_split(&self, document_id: &str) -> Result<SplitOutcome> {
        let document = self.require_document(document_id).await?;
        if document.status != DocumentStatus::Pending {
            return Err(DocsplitError::InvalidTransition {
                from: document.status.to_string(),
                to: DocumentStatus::Splitting.to_string(),
            });
        }

        let (verdict, loaded) = match self.classify(&document).await {
            Ok(classified) => classified,
            Err(DocsplitError::Introspection(message)) => {
                log::warn!("Cannot inspect {}: {} (processing whole)", document.original_filename, message);
                return self.keep_whole(&document, Some(message)).await;
            }
            Err(e) => return Err(e),
        };

        let plan = match plan_split(document.format_class, document.byte_size, &verdict, &self.config.splitting) {
            Some(plan) if plan.estimated_chunks >= 2 => plan,
            Some(plan) => {
                let warning = format!(
                    "{} but planned {} part(s); processed whole",
                    plan.reason, plan.estimated_chunks
                );
                log::warn!("{}: {}", document.original_filename, warning);
                let mut outcome = self.keep_whole(&document, Some(warning)).await?;
                outcome.reason = Some(plan.reason);
                return Ok(outcome);
            }
            None => return self.keep_whole(&document, verdict.warning).await,
        };
        let loaded = match plan.strategy {
            SplitStrategy::PaginatedBinary => loaded,
            _ => None,
        };
        log::info!(
            "Splitting {} ({}): {:?} into ~{} parts",
            document.original_filename,
            plan.reason,
            plan.strategy,
            plan.estimated_chunks
        );

        self.tracker
            .transition_document(document_id, DocumentStatus::Splitting, DocumentUpdate::default())
            .await?;

        let area = match self.areas.allocate(document_id).await {
            Ok(area) => area,
            Err(e) => {
                self.tracker.fail_document(document_id, &format!("split failed: {}", e)).await?;
                return Err(e);
            }
        };

        let writer = self.writer.clone();
        let source = document.stored_path.clone();
        let name = document.original_filename.clone();
        let area_dir = area.path.clone();
        let written_plan = plan.clone();
        let written =
            tokio::task::spawn_blocking(move || writer.write_loaded(&source, loaded, &name, &written_plan, &area_dir))
            .await
            .map_err(|e| DocsplitError::Write(format!("split task join: {}", e)))
            .and_then(|r| r);

        let written = match written {
            Ok(written) => written,
            Err(e) => {
                log::error!("Split of {} failed: {}", document_id, e);
                self.discard_area(&area.id).await;
                self.tracker.fail_document(document_id, &format!("split failed: {}", e)).await?;
                return Err(e);
            }
        };

        if written.len() < 2 {
            log::info!(
                "{} produced {} part(s); processing whole",
                document.original_filename,
                written.len()
            );
            self.discard_area(&area.id).await;
            self.tracker
                .transition_document(document_id, DocumentStatus::Processing, DocumentUpdate::default())
                .await?;
            return Ok(SplitOutcome::atomic(Some(format!(
                "split produced {} part(s); processed whole",
                written.len()
            ))));
        }

        let registered = match self
            .tracker
            .register_parts(document_id, written, plan.reason.as_str(), &area.id)
            .await
        {
            Ok(registered) => registered,
            Err(e) => {
                self.discard_area(&area.id).await;
                self.tracker.fail_document(document_id, &format!("split failed: {}", e)).await?;
                return Err(e);
            }
        };

        Ok(SplitOutcome {
            should_split: true,
            working_area_path: Some(area.path),
            parts: registered,
            reason: Some(plan.reason),
            warning: verdict.warning,
        })
    }

    pub fn submit_parts_for_processing(&self, parts: Vec<DocumentPart>) -> ProcessingHandle {
        self.pool.submit_parts(parts)
    }

    /// Convert a document that was not split. It must be PROCESSING.
    pub async fn process_atomic(&self, document_id: &str) -> Result<ProcessingHandle> {
        let document = self.require_document(document_id).await?;
        if document.status != DocumentStatus::Processing || document.is_split {
            return Err(DocsplitError::InvalidInput(format!(
                "document {} is {} and cannot be processed whole",
                document_id, document.status
            )));
        }
        Ok(self.pool.submit_atomic(document))
    }

    /// Register, split if needed and submit for processing.
    pub async fn ingest(&self, path: &Path, original_filename: &str) -> Result<Ingestion> {
        let document = self.register_upload(path, original_filename).await?;
        let split = self.plan_and_split(&document.id).await?;
        let handle = if split.should_split {
            self.submit_parts_for_processing(split.parts.clone())
        } else {
            self.process_atomic(&document.id).await?
        };
        Ok(Ingestion {
            document_id: document.id,
            split,
            handle,
        })
    }

    pub async fn document_status(&self, document_id: &str) -> Result<DocumentStatusReport> {
        let id = document_id.to_string();
        let (document, parts) = self
            .db
            .with_connection(move |conn| {
                let document = documents::require(conn, &id)?;
                let parts = parts::list_for_document(conn, &id)?;
                Ok((document, parts))
            })
            .await?;
        Ok(DocumentStatusReport {
            in_flight: self.outstanding.in_flight(document_id),
            document,
            parts,
        })
    }

    /// Delete the document's working areas now, or, if work is still in
    /// flight, expire them so the janitor reclaims them once it drains.
    pub async fn force_cleanup(&self, document_id: &str) -> Result<CleanupOutcome> {
        let areas = self.areas.live_for_document(document_id).await?;
        if areas.is_empty() {
            return Ok(CleanupOutcome::NothingToClean);
        }

        let id = document_id.to_string();
        let db_in_flight = self
            .db
            .with_connection(move |conn| parts::count_in_flight(conn, &id))
            .await?;
        if db_in_flight > 0 || self.outstanding.in_flight(document_id) > 0 {
            for area in &areas {
                self.areas.expire(&area.id).await?;
            }
            log::info!("Cleanup of {} deferred: work in flight", document_id);
            return Ok(CleanupOutcome::Deferred { areas: areas.len() });
        }

        let mut deleted = 0;
        for area in &areas {
            if self.areas.release(&area.id).await? {
                deleted += 1;
            }
        }
        Ok(CleanupOutcome::Deleted { areas: deleted })
    }

    /// Cancel outstanding work, delete the document rows and reclaim its
    /// working areas.
    ///
    /// With work in flight the rows stay until the last worker drains, so
    /// every cancelled part is recorded first; the areas are expired and the
    /// pool deletes everything at that point.
    pub async fn delete_document(&self, document_id: &str) -> Result<CleanupOutcome> {
        self.require_document(document_id).await?;
        self.cancel_flags.cancel(document_id);

        let in_flight = self.outstanding.in_flight(document_id);
        if in_flight > 0 {
            log::info!("Deletion of {} deferred until {} unit(s) drain", document_id, in_flight);
            return self.force_cleanup(document_id).await;
        }

        let id = document_id.to_string();
        self.db.with_connection(move |conn| documents::delete(conn, &id)).await?;
        log::info!("Deleted document {}", document_id);

        let outcome = self.force_cleanup(document_id).await?;
        if self.outstanding.in_flight(document_id) == 0 {
            self.cancel_flags.clear(document_id);
        }
        Ok(outcome)
    }

    async fn require_document(&self, document_id: &str) -> Result<Document> {
        let id = document_id.to_string();
        self.db.with_connection(move |conn| documents::require(conn, &id)).await
    }

    async fn classify(&self, document: &Document) -> Result<(SplitVerdict, Option<lopdf::Document>)> {
        let classifier = self.classifier.clone();
        let path = document.stored_path.clone();
        let format = document.format_class;
        let byte_size = document.byte_size;
        tokio::task::spawn_blocking(move || classifier.classify_and_load(&path, format, byte_size))
            .await
            .map_err(|e| DocsplitError::Introspection(format!("classifier task join: {}", e)))?
    }

    async fn keep_whole(&self, document: &Document, warning: Option<String>) -> Result<SplitOutcome> {
        self.tracker
            .transition_document(&document.id, DocumentStatus::Processing, DocumentUpdate::default())
            .await?;
        Ok(SplitOutcome::atomic(warning))
    }

    async fn discard_area(&self, area_id: &str) {
        if let Err(e) = self.areas.release(area_id).await {
            log::error!("Failed to discard working area {}: {} (janitor will retry)", area_id, e);
        }
    }
}
