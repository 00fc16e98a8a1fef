use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::converter::{Conversion, Converter};
use crate::config::ProcessingConfig;
use crate::error::{DocsplitError, Result};
use crate::split::WorkingAreaManager;
use crate::status::{CancelFlags, OutstandingParts, PartStatus, ReconcileOutcome, Reconciler, StatusTracker};
use crate::store::{Document, DocumentPart};

/// Error message of work abandoned because its document was deleted
pub const CANCELLED_MESSAGE: &str = "cancelled: document deleted";

/// Tries at the validated terminal write before the part is forced to ERROR
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Handle on submitted work; dropping it does not stop the workers.
#[derive(Debug)]
pub struct ProcessingHandle {
    document_ids: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessingHandle {
    pub fn document_ids(&self) -> &[String] {
        &self.document_ids
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every submitted unit has finished (and reconciliation ran).
    pub async fn wait(self) -> Result<()> {
        for task in self.tasks {
            task.await
                .map_err(|e| DocsplitError::PartProcessing(format!("worker task failed: {}", e)))?;
        }
        Ok(())
    }
}

/// What the retry loop ended with
struct Attempted {
    conversion: Option<Conversion>,
    attempts: u32,
    last_error: String,
    cancelled: bool,
}

/// Terminal state a worker records for its part
#[derive(Debug)]
struct PartOutcome {
    status: PartStatus,
    error_message: Option<String>,
    warning: Option<String>,
    content: Option<String>,
    attempts: u32,
}

impl PartOutcome {
    fn failed(message: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: PartStatus::Error,
            error_message: Some(message.into()),
            warning: None,
            content: None,
            attempts,
        }
    }

    fn cancelled(attempts: u32) -> Self {
        Self::failed(CANCELLED_MESSAGE, attempts)
    }
}

/// Bounded pool converting parts (and whole documents) concurrently.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    converter: Arc<dyn Converter>,
    tracker: StatusTracker,
    reconciler: Reconciler,
    areas: WorkingAreaManager,
    outstanding: OutstandingParts,
    cancel_flags: CancelFlags,
    part_timeout: Duration,
    retry_count: u32,
}

impl WorkerPool {
    pub fn new(
        config: &ProcessingConfig,
        converter: Arc<dyn Converter>,
        tracker: StatusTracker,
        reconciler: Reconciler,
        areas: WorkingAreaManager,
        outstanding: OutstandingParts,
        cancel_flags: CancelFlags,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.worker_concurrency.max(1))),
            converter,
            tracker,
            reconciler,
            areas,
            outstanding,
            cancel_flags,
            part_timeout: config.part_timeout(),
            retry_count: config.retry_count,
        }
    }

    /// Queue parts in sequence order. The last part of each document to
    /// finish triggers reconciliation.
    pub fn submit_parts(&self, parts: Vec<DocumentPart>) -> ProcessingHandle {
        let mut by_document: BTreeMap<String, Vec<DocumentPart>> = BTreeMap::new();
        for part in parts {
            by_document.entry(part.document_id.clone()).or_default().push(part);
        }

        let mut handle = ProcessingHandle {
            document_ids: Vec::with_capacity(by_document.len()),
            tasks: Vec::new(),
        };
        for (document_id, mut doc_parts) in by_document {
            doc_parts.sort_by_key(|p| p.sequence_index);
            self.outstanding.register(&document_id, doc_parts.len());
            log::info!("Submitting {} parts of document {}", doc_parts.len(), document_id);

            for part in doc_parts {
                let pool = self.clone();
                handle.tasks.push(tokio::spawn(async move {
                    pool.run_part(part).await;
                }));
            }
            handle.document_ids.push(document_id);
        }
        handle
    }

    /// Queue a document that is converted whole. It must already be PROCESSING.
    pub fn submit_atomic(&self, document: Document) -> ProcessingHandle {
        self.outstanding.register(&document.id, 1);
        let document_id = document.id.clone();
        let pool = self.clone();
        let task = tokio::spawn(async move {
            pool.run_atomic(document).await;
        });
        ProcessingHandle {
            document_ids: vec![document_id],
            tasks: vec![task],
        }
    }

    async fn run_part(&self, part: DocumentPart) {
        let outcome = self.process_part(&part).await;
        self.record_outcome(&part, outcome).await;
        self.finish_unit(&part.document_id, true).await;
    }

    async fn process_part(&self, part: &DocumentPart) -> PartOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => return PartOutcome::failed(format!("worker pool closed: {}", e), 0),
        };

        if self.cancel_flags.is_cancelled(&part.document_id) {
            log::debug!("Part {} of {} cancelled before start", part.sequence_index, part.document_id);
            return PartOutcome::cancelled(0);
        }

        if let Err(e) = self
            .tracker
            .transition_part(&part.id, PartStatus::Processing, None, None, None, Some(0))
            .await
        {
            return PartOutcome::failed(format!("cannot start: {}", e), 0);
        }

        let attempted = self.convert_with_retries(&part.file_path, &part.document_id).await;
        if attempted.cancelled || self.cancel_flags.is_cancelled(&part.document_id) {
            return PartOutcome::cancelled(attempted.attempts);
        }

        match attempted.conversion {
            Some(conversion) => {
                if let Some(warning) = &conversion.error {
                    log::warn!("Part {} of {} converted with warning: {}", part.sequence_index, part.document_id, warning);
                }
                PartOutcome {
                    status: PartStatus::Completed,
                    error_message: None,
                    warning: conversion.error,
                    content: conversion.content,
                    attempts: attempted.attempts,
                }
            }
            None => {
                log::warn!(
                    "Part {} of {} failed after {} attempts: {}",
                    part.sequence_index,
                    part.document_id,
                    attempted.attempts,
                    attempted.last_error
                );
                PartOutcome::failed(attempted.last_error, attempted.attempts)
            }
        }
    }

    /// Persist the part's terminal state. A part whose result cannot be
    /// written is forced to ERROR so it never stays in flight after its
    /// worker is gone.
    async fn record_outcome(&self, part: &DocumentPart, outcome: PartOutcome) {
        let mut last_error = String::new();
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            let written = self
                .tracker
                .transition_part(
                    &part.id,
                    outcome.status,
                    outcome.error_message.clone(),
                    outcome.warning.clone(),
                    outcome.content.clone(),
                    Some(outcome.attempts),
                )
                .await;
            match written {
                Ok(_) => return,
                Err(DocsplitError::PartNotFound(_)) => {
                    log::debug!("Part {} of {} deleted before its result was recorded", part.sequence_index, part.document_id);
                    return;
                }
                Err(e) => {
                    log::warn!(
                        "Recording part {} of {} failed ({}/{}): {}",
                        part.sequence_index,
                        part.document_id,
                        attempt,
                        TERMINAL_WRITE_ATTEMPTS,
                        e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < TERMINAL_WRITE_ATTEMPTS {
                tokio::time::sleep(TERMINAL_WRITE_BACKOFF).await;
            }
        }

        let message = format!("could not record result: {}", last_error);
        match self.tracker.force_part_error(&part.id, &message).await {
            Ok(true) => log::error!("Part {} of {} forced to error: {}", part.sequence_index, part.document_id, message),
            Ok(false) => log::debug!("Part {} of {} already terminal", part.sequence_index, part.document_id),
            Err(e) => log::error!("Part {} of {} left in flight: {}", part.sequence_index, part.document_id, e),
        }
    }

    async fn run_atomic(&self, document: Document) {
        if let Err(e) = self.process_atomic(&document).await {
            log::error!("Document {} could not be finalized: {}", document.id, e);
            let message = format!("could not record result: {}", e);
            if let Err(e) = self.tracker.fail_document(&document.id, &message).await {
                log::error!("Document {} left in flight: {}", document.id, e);
            }
        }
        self.finish_unit(&document.id, false).await;
    }

    async fn process_atomic(&self, document: &Document) -> Result<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| DocsplitError::PartProcessing(format!("worker pool closed: {}", e)))?;

        let attempted = if self.cancel_flags.is_cancelled(&document.id) {
            Attempted {
                conversion: None,
                attempts: 0,
                last_error: CANCELLED_MESSAGE.to_string(),
                cancelled: true,
            }
        } else {
            self.convert_with_retries(&document.stored_path, &document.id).await
        };

        if attempted.cancelled || self.cancel_flags.is_cancelled(&document.id) {
            self.tracker.fail_document(&document.id, CANCELLED_MESSAGE).await?;
            return Ok(());
        }

        let conversion = attempted
            .conversion
            .unwrap_or_else(|| Conversion::failure(attempted.last_error));
        self.reconciler.finalize_atomic(&document.id, conversion).await?;
        Ok(())
    }

    /// Up to `1 + retry_count` attempts, each bounded by the part timeout.
    /// Transport errors, timeouts and conversions without content are all
    /// retried.
    async fn convert_with_retries(&self, path: &Path, document_id: &str) -> Attempted {
        let max_attempts = 1 + self.retry_count;
        let mut last_error = String::from("not attempted");
        let mut attempts = 0;

        while attempts < max_attempts {
            if self.cancel_flags.is_cancelled(document_id) {
                return Attempted {
                    conversion: None,
                    attempts,
                    last_error: CANCELLED_MESSAGE.to_string(),
                    cancelled: true,
                };
            }
            attempts += 1;

            match tokio::time::timeout(self.part_timeout, self.converter.convert(path)).await {
                Ok(Ok(conversion)) if conversion.is_success() => {
                    return Attempted {
                        conversion: Some(conversion),
                        attempts,
                        last_error,
                        cancelled: false,
                    };
                }
                Ok(Ok(conversion)) => {
                    last_error = conversion
                        .error
                        .unwrap_or_else(|| "converter returned no content".to_string());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {}s", self.part_timeout.as_secs_f64());
                }
            }
            log::debug!("Attempt {}/{} on {} failed: {}", attempts, max_attempts, path.display(), last_error);
        }

        Attempted {
            conversion: None,
            attempts,
            last_error,
            cancelled: false,
        }
    }

    async fn finish_unit(&self, document_id: &str, split: bool) {
        if !self.outstanding.decrement_and_check_zero(document_id) {
            return;
        }
        if self.cancel_flags.is_cancelled(document_id) {
            self.purge_deleted(document_id).await;
            return;
        }
        if !split {
            return;
        }
        match self.reconciler.reconcile(document_id).await {
            Ok(ReconcileOutcome::NotReady { in_flight }) => log::error!(
                "Document {} still has {} part(s) in flight after its last worker finished",
                document_id,
                in_flight
            ),
            Ok(outcome) => log::debug!("Reconciled {}: {:?}", document_id, outcome),
            Err(e) => log::error!("Reconciliation of {} failed: {}", document_id, e),
        }
    }

    /// Remove a document deleted while its work was running, now that the
    /// last unit has drained.
    async fn purge_deleted(&self, document_id: &str) {
        match self.tracker.delete_document(document_id).await {
            Ok(_) => log::info!("Deleted document {} after its cancelled work drained", document_id),
            Err(e) => log::error!("Failed to delete document {}: {}", document_id, e),
        }
        match self.areas.live_for_document(document_id).await {
            Ok(areas) => {
                for area in areas {
                    if let Err(e) = self.areas.release(&area.id).await {
                        log::error!("Failed to release working area {}: {} (janitor will retry)", area.id, e);
                    }
                }
            }
            Err(e) => log::error!("Cannot list working areas of {}: {}", document_id, e),
        }
        self.cancel_flags.clear(document_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Db;
    use crate::process::converter::PlainTextConverter;
    use crate::split::{WorkingAreaManager, WrittenPart};
    use crate::status::DocumentStatus;
    use crate::store::documents;
    use crate::store::test_support::setup_test_db;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts calls; fails the first `failures` of them
    struct CountingConverter {
        calls: AtomicUsize,
        failures: usize,
        delay: Option<Duration>,
        /// Fail with a content-less `Conversion` instead of an `Err`
        reported: bool,
    }

    impl CountingConverter {
        fn new(failures: usize, delay: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
                delay,
                reported: false,
            })
        }

        fn reporting(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
                delay: None,
                reported: true,
            })
        }
    }

    #[async_trait]
    impl Converter for CountingConverter {
        async fn convert(&self, path: &Path) -> Result<Conversion> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if call < self.failures {
                if self.reported {
                    return Ok(Conversion::failure("unreadable page"));
                }
                return Err(DocsplitError::Converter("flaky".to_string()));
            }
            PlainTextConverter.convert(path).await
        }
    }

    struct Fixture {
        db: Db,
        temp_dir: TempDir,
        tracker: StatusTracker,
        cancel_flags: CancelFlags,
    }

    impl Fixture {
        async fn new() -> Self {
            let (db, temp_dir) = setup_test_db().await;
            Self {
                tracker: StatusTracker::new(db.clone()),
                db,
                temp_dir,
                cancel_flags: CancelFlags::new(),
            }
        }

        fn pool(&self, converter: Arc<dyn Converter>, timeout_ms: u64) -> WorkerPool {
            let config = ProcessingConfig {
                worker_concurrency: 2,
                part_timeout_secs: 1,
                retry_count: 1,
                error_ratio_threshold: 0.5,
                cleanup_on_completion: false,
            };
            let areas = WorkingAreaManager::new(
                self.db.clone(),
                self.temp_dir.path(),
                chrono::Duration::hours(24),
                Arc::new(ManualClock::new(Utc::now())),
            );
            let reconciler = Reconciler::new(self.db.clone(), &config, areas.clone());
            let mut pool = WorkerPool::new(
                &config,
                converter,
                self.tracker.clone(),
                reconciler,
                areas,
                OutstandingParts::new(),
                self.cancel_flags.clone(),
            );
            pool.part_timeout = Duration::from_millis(timeout_ms);
            pool
        }

        /// Split document with one text file per part
        async fn split_document(&self, contents: &[&str]) -> Vec<DocumentPart> {
            let n = contents.len() as u32;
            let written: Vec<WrittenPart> = contents
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    let path = self.temp_dir.path().join(format!("report_part{}of{}.txt", i + 1, n));
                    std::fs::write(&path, text).unwrap();
                    WrittenPart {
                        sequence_index: i as u32 + 1,
                        total_parts: n,
                        path,
                        byte_size: text.len() as u64,
                    }
                })
                .collect();
            self.db
                .with_connection(|conn| documents::insert(conn, &documents::sample("doc-1", DocumentStatus::Splitting)))
                .await
                .unwrap();
            self.tracker
                .register_parts("doc-1", written, "oversized-bytes", "area-1")
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_parts_complete_and_parent_reconciles() {
        let fixture = Fixture::new().await;
        let parts = fixture.split_document(&["alpha", "beta", "gamma"]).await;
        let pool = fixture.pool(Arc::new(PlainTextConverter), 5_000);

        let handle = pool.submit_parts(parts);
        assert_eq!(handle.task_count(), 3);
        handle.wait().await.unwrap();

        let doc = fixture.tracker.document("doc-1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(doc.processed_content.as_deref(), Some("alpha\n\nbeta\n\ngamma"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_calls_converter() {
        let fixture = Fixture::new().await;
        let parts = fixture.split_document(&["a", "b", "c"]).await;
        let converter = CountingConverter::new(0, None);
        let pool = fixture.pool(converter.clone(), 5_000);

        fixture.cancel_flags.cancel("doc-1");
        pool.submit_parts(parts).wait().await.unwrap();

        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
        // The deleted document's rows go once its last part drains
        assert!(fixture.tracker.document("doc-1").await.unwrap().is_none());
        assert!(fixture.tracker.parts("doc-1").await.unwrap().is_empty());
        assert!(!fixture.cancel_flags.is_cancelled("doc-1"));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let fixture = Fixture::new().await;
        let parts = fixture.split_document(&["only", "two"]).await;
        let converter = CountingConverter::new(1, None);
        let pool = fixture.pool(converter.clone(), 5_000);

        pool.submit_parts(parts).wait().await.unwrap();

        let parts = fixture.tracker.parts("doc-1").await.unwrap();
        assert!(parts.iter().all(|p| p.status == PartStatus::Completed));
        assert_eq!(parts.iter().map(|p| p.attempts).sum::<u32>(), 3);
        assert_eq!(converter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_exhausts_attempts() {
        let fixture = Fixture::new().await;
        let parts = fixture.split_document(&["slow", "slower"]).await;
        let converter = CountingConverter::new(0, Some(Duration::from_millis(500)));
        let pool = fixture.pool(converter, 20);

        pool.submit_parts(parts).wait().await.unwrap();

        let parts = fixture.tracker.parts("doc-1").await.unwrap();
        for part in &parts {
            assert_eq!(part.status, PartStatus::Error);
            assert_eq!(part.attempts, 2);
            assert!(part.error_message.as_deref().unwrap().starts_with("timed out"));
        }
        let doc = fixture.tracker.document("doc-1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
    }

    #[tokio::test]
    async fn test_atomic_document_is_finalized() {
        let fixture = Fixture::new().await;
        let path = fixture.temp_dir.path().join("small.txt");
        std::fs::write(&path, "small document").unwrap();
        let mut doc = documents::sample("doc-2", DocumentStatus::Processing);
        doc.stored_path = path;
        let row = doc.clone();
        fixture
            .db
            .with_connection(move |conn| documents::insert(conn, &row))
            .await
            .unwrap();

        let pool = fixture.pool(Arc::new(PlainTextConverter), 5_000);
        pool.submit_atomic(doc).wait().await.unwrap();

        let doc = fixture.tracker.document("doc-2").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(doc.processed_content.as_deref(), Some("small document"));
    }

    #[tokio::test]
    async fn test_reported_failure_is_retried() {
        let fixture = Fixture::new().await;
        let parts = fixture.split_document(&["first", "second"]).await;
        let converter = CountingConverter::reporting(2);
        let pool = fixture.pool(converter.clone(), 5_000);

        pool.submit_parts(parts).wait().await.unwrap();

        let parts = fixture.tracker.parts("doc-1").await.unwrap();
        assert!(parts.iter().all(|p| p.status == PartStatus::Completed));
        assert!(parts.iter().all(|p| p.attempts == 2));
        assert_eq!(converter.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unrecordable_result_forces_part_error_and_parent_finalizes() {
        let fixture = Fixture::new().await;
        let parts = fixture.split_document(&["alpha", "beta"]).await;
        fixture
            .db
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_second_part BEFORE UPDATE OF status ON document_parts \
                     WHEN NEW.status = 'completed' AND OLD.sequence_index = 2 \
                     BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let pool = fixture.pool(Arc::new(PlainTextConverter), 5_000);

        pool.submit_parts(parts).wait().await.unwrap();

        let parts = fixture.tracker.parts("doc-1").await.unwrap();
        assert_eq!(parts[0].status, PartStatus::Completed);
        assert_eq!(parts[1].status, PartStatus::Error);
        let message = parts[1].error_message.as_deref().unwrap();
        assert!(message.starts_with("could not record result"));
        assert!(message.contains("disk I/O error"));

        let doc = fixture.tracker.document("doc-1").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Incomplete);
    }
}
