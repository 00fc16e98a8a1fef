//! Reclaims working areas whose retention deadline has passed.
//!
//! A sweep deletes every expired, still-live area whose document has no work
//! in flight, then removes `split_*` directories that have no database row at
//! all (left behind by a crash between mkdir and insert). Failures are logged
//! per area and never abort the sweep.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::clock::Clock;
use crate::db::Db;
use crate::error::{DocsplitError, Result};
use crate::split::{WorkingArea, WorkingAreaManager, WORKING_AREA_PREFIX};
use crate::status::OutstandingParts;
use crate::store::{parts, working_areas};

/// Counts from one sweep
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub deleted: usize,
    pub skipped_in_flight: usize,
    /// Claimed by someone else between listing and deleting
    pub already_deleted: usize,
    pub orphans_removed: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Janitor {
    db: Db,
    areas: WorkingAreaManager,
    outstanding: OutstandingParts,
    clock: Arc<dyn Clock>,
}

impl Janitor {
    pub fn new(db: Db, areas: WorkingAreaManager, outstanding: OutstandingParts, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            areas,
            outstanding,
            clock,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired = self
            .db
            .with_connection(move |conn| working_areas::list_expired(conn, now))
            .await?;

        let mut report = SweepReport {
            expired: expired.len(),
            ..Default::default()
        };

        for area in &expired {
            match self.reclaim(area).await {
                Ok(Reclaim::Deleted) => report.deleted += 1,
                Ok(Reclaim::InFlight) => report.skipped_in_flight += 1,
                Ok(Reclaim::AlreadyDeleted) => report.already_deleted += 1,
                Err(e) => {
                    report.errors += 1;
                    log::error!("janitor: failed to reclaim {}: {}", area.path.display(), e);
                }
            }
        }

        match self.sweep_orphans(now).await {
            Ok((removed, errors)) => {
                report.orphans_removed = removed;
                report.errors += errors;
            }
            Err(e) => {
                report.errors += 1;
                log::error!("janitor: orphan scan failed: {}", e);
            }
        }

        if report.deleted + report.orphans_removed + report.errors > 0 {
            log::info!(
                "janitor: {} expired, {} deleted, {} in flight, {} orphans removed, {} errors",
                report.expired,
                report.deleted,
                report.skipped_in_flight,
                report.orphans_removed,
                report.errors
            );
        } else {
            log::debug!("janitor: nothing to reclaim ({} expired)", report.expired);
        }
        Ok(report)
    }

    async fn reclaim(&self, area: &WorkingArea) -> Result<Reclaim> {
        if self.outstanding.in_flight(&area.document_id) > 0 {
            return Ok(Reclaim::InFlight);
        }
        let document_id = area.document_id.clone();
        let in_flight = self
            .db
            .with_connection(move |conn| parts::count_in_flight(conn, &document_id))
            .await?;
        if in_flight > 0 {
            log::debug!("janitor: {} has {} parts in flight, skipping", area.path.display(), in_flight);
            return Ok(Reclaim::InFlight);
        }

        if self.areas.release(&area.id).await? {
            Ok(Reclaim::Deleted)
        } else {
            Ok(Reclaim::AlreadyDeleted)
        }
    }

    /// Remove unrecorded `split_*` directories older than the retention window.
    async fn sweep_orphans(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let known: HashSet<PathBuf> = self
            .db
            .with_connection(|conn| working_areas::known_paths(conn))
            .await?
            .into_iter()
            .collect();
        let root = self.areas.root().to_path_buf();
        let cutoff = now - self.areas.retention();

        tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            let mut errors = 0;
            for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("janitor: cannot read entry under {}: {}", root.display(), e);
                        errors += 1;
                        continue;
                    }
                };
                if !entry.file_type().is_dir()
                    || !entry.file_name().to_string_lossy().starts_with(WORKING_AREA_PREFIX)
                    || known.contains(entry.path())
                {
                    continue;
                }

                let modified: DateTime<Utc> = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                    Some(time) => time.into(),
                    None => continue,
                };
                if modified > cutoff {
                    continue;
                }

                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => {
                        log::info!("janitor: removed orphaned working area {}", entry.path().display());
                        removed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        log::error!("janitor: cannot remove {}: {}", entry.path().display(), e);
                        errors += 1;
                    }
                }
            }
            (removed, errors)
        })
        .await
        .map_err(|e| DocsplitError::Config(format!("orphan scan task join: {}", e)))
    }
}

enum Reclaim {
    Deleted,
    InFlight,
    AlreadyDeleted,
}

/// Runs `Janitor::sweep` on a fixed interval until stopped.
pub struct JanitorService {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl JanitorService {
    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn start(janitor: Janitor, interval: Duration) -> Self {
        let (tx, mut rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut rx => {
                        log::info!("janitor: shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = janitor.sweep().await {
                            log::error!("janitor: sweep failed: {}", e);
                        }
                    }
                }
            }
        });
        log::info!("janitor: sweeping every {:?}", interval);
        Self {
            shutdown_tx: Some(tx),
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal shutdown and wait for an in-progress sweep to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle
            .await
            .map_err(|e| DocsplitError::Config(format!("janitor task join: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::split::WrittenPart;
    use crate::status::{DocumentStatus, StatusTracker};
    use crate::store::documents;
    use crate::store::test_support::setup_test_db;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    struct Fixture {
        db: Db,
        _temp_dir: TempDir,
        clock: Arc<ManualClock>,
        areas: WorkingAreaManager,
        outstanding: OutstandingParts,
    }

    impl Fixture {
        async fn new() -> Self {
            let (db, temp_dir) = setup_test_db().await;
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let areas = WorkingAreaManager::new(db.clone(), temp_dir.path(), ChronoDuration::hours(24), clock.clone());
            Self {
                db,
                _temp_dir: temp_dir,
                clock,
                areas,
                outstanding: OutstandingParts::new(),
            }
        }

        fn janitor(&self) -> Janitor {
            Janitor::new(self.db.clone(), self.areas.clone(), self.outstanding.clone(), self.clock.clone())
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_expired_once() {
        let fixture = Fixture::new().await;
        let old = fixture.areas.allocate("doc-1").await.unwrap();
        fixture.clock.advance(ChronoDuration::hours(23));
        let young = fixture.areas.allocate("doc-2").await.unwrap();
        fixture.clock.advance(ChronoDuration::hours(2));

        let janitor = fixture.janitor();
        let first = janitor.sweep().await.unwrap();
        assert_eq!(first.expired, 1);
        assert_eq!(first.deleted, 1);
        assert!(!old.path.exists());
        assert!(young.path.exists());

        let second = janitor.sweep().await.unwrap();
        assert_eq!(second.deleted, 0);
        assert_eq!(second.errors, 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_areas_with_work_in_flight() {
        let fixture = Fixture::new().await;
        let area = fixture.areas.allocate("doc-1").await.unwrap();

        fixture
            .db
            .with_connection(|conn| documents::insert(conn, &documents::sample("doc-1", DocumentStatus::Splitting)))
            .await
            .unwrap();
        let written = vec![1, 2]
            .into_iter()
            .map(|i| WrittenPart {
                sequence_index: i,
                total_parts: 2,
                path: area.path.join(format!("report_part{}of2.txt", i)),
                byte_size: 1,
            })
            .collect();
        StatusTracker::new(fixture.db.clone())
            .register_parts("doc-1", written, "oversized-bytes", &area.id)
            .await
            .unwrap();

        fixture.clock.advance(ChronoDuration::hours(25));
        let report = fixture.janitor().sweep().await.unwrap();
        assert_eq!(report.skipped_in_flight, 1);
        assert!(area.path.exists());
    }

    #[tokio::test]
    async fn test_sweep_skips_outstanding_after_document_deleted() {
        let fixture = Fixture::new().await;
        let area = fixture.areas.allocate("doc-1").await.unwrap();
        fixture.outstanding.register("doc-1", 1);
        fixture.clock.advance(ChronoDuration::hours(25));

        let janitor = fixture.janitor();
        assert_eq!(janitor.sweep().await.unwrap().skipped_in_flight, 1);
        assert!(area.path.exists());

        fixture.outstanding.decrement_and_check_zero("doc-1");
        assert_eq!(janitor.sweep().await.unwrap().deleted, 1);
        assert!(!area.path.exists());
    }

    #[tokio::test]
    async fn test_sweep_tolerates_directory_removed_externally() {
        let fixture = Fixture::new().await;
        let area = fixture.areas.allocate("doc-1").await.unwrap();
        std::fs::remove_dir_all(&area.path).unwrap();
        fixture.clock.advance(ChronoDuration::hours(25));

        let report = fixture.janitor().sweep().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_orphan_directories_are_removed_after_retention() {
        let fixture = Fixture::new().await;
        let orphan = fixture.areas.root().join(format!("{}orphan", WORKING_AREA_PREFIX));
        let unrelated = fixture.areas.root().join("uploads");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::create_dir_all(&unrelated).unwrap();

        let janitor = fixture.janitor();
        assert_eq!(janitor.sweep().await.unwrap().orphans_removed, 0);
        assert!(orphan.exists());

        fixture.clock.advance(ChronoDuration::hours(25));
        assert_eq!(janitor.sweep().await.unwrap().orphans_removed, 1);
        assert!(!orphan.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_service_sweeps_until_stopped() {
        let fixture = Fixture::new().await;
        let area = fixture.areas.allocate("doc-1").await.unwrap();
        fixture.clock.advance(ChronoDuration::hours(25));

        let service = JanitorService::start(fixture.janitor(), Duration::from_millis(10));
        for _ in 0..200 {
            if !area.path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!area.path.exists());
        assert!(service.is_running());
        service.stop().await.unwrap();
    }
}
