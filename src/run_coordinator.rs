//! Serializes and deduplicates indexing runs.
//!
//! At most one run is active per (project, path). A trigger that arrives while
//! that pair is in flight is dropped, not queued.
//!
//! Cron ticks and manual schedule triggers run all of a schedule's paths as one
//! batch; that schedule's last-run is written once the last path finishes, and
//! only if none of them failed. A file change runs a single path and advances
//! every schedule of the project that owns it.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use threadpool::ThreadPool;

use crate::database::Database;
use crate::error::IndexWatchError;
use crate::pipeline::IndexingPipeline;
use crate::schedules::Schedule;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub project_id: String,
    pub path: String,
}

impl RunKey {
    pub fn new(project_id: &str, path: &str) -> Self {
        RunKey {
            project_id: project_id.to_string(),
            path: path.to_string(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Cron,
    FileChange,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerSource::Cron => "cron",
            TriggerSource::FileChange => "file change",
            TriggerSource::Manual => "manual",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { schedules_updated: usize },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct RunCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

type ClaimSet = Arc<Mutex<HashSet<RunKey>>>;

/// Holds the in-flight slot for one (project, path). Dropping it releases the slot.
struct RunClaim {
    key: RunKey,
    claims: ClaimSet,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.claims.lock().unwrap().remove(&self.key);
    }
}

/// Shared by the runs of one schedule-level trigger
struct ScheduleRun {
    schedule_id: String,
    requested_at: DateTime<Utc>,
    remaining: AtomicUsize,
    failed: AtomicBool,
}

impl ScheduleRun {
    /// Returns true for the last path of the batch to finish
    fn finish_path(&self, failed: bool) -> bool {
        if failed {
            self.failed.store(true, Ordering::SeqCst);
        }
        self.remaining.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

/// Which last-run rows a successful run advances
enum RunScope {
    Path,
    Schedule(Arc<ScheduleRun>),
}

pub struct RunCoordinator {
    db: Database,
    pipeline: Arc<dyn IndexingPipeline>,
    claims: ClaimSet,
    pool: Mutex<ThreadPool>,
    counters: RunCounters,
}

impl fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("in_flight", &self.in_flight_count())
            .field("stats", &self.stats())
            .finish()
    }
}

impl RunCoordinator {
    pub fn new(db: Database, pipeline: Arc<dyn IndexingPipeline>, worker_threads: usize) -> Self {
        let pool = ThreadPool::with_name("indexwatch-run".to_string(), worker_threads.max(1));

        RunCoordinator {
            db,
            pipeline,
            claims: Arc::new(Mutex::new(HashSet::new())),
            pool: Mutex::new(pool),
            counters: RunCounters::default(),
        }
    }

    /// Run the pipeline for (project, path) on the calling thread
    pub fn trigger(
        &self,
        project_id: &str,
        path: &str,
        source: TriggerSource,
    ) -> Result<RunOutcome, IndexWatchError> {
        let requested_at = Utc::now();
        match self.claim(project_id, path, source) {
            Some(claim) => self.run_claimed(claim, source, requested_at, RunScope::Path),
            None => Ok(RunOutcome::AlreadyRunning),
        }
    }

    /// Claim (project, path) now and run it on the worker pool.
    /// Returns false when a run for the pair is already in flight.
    pub fn submit(
        self: &Arc<Self>,
        project_id: &str,
        path: &str,
        source: TriggerSource,
        requested_at: DateTime<Utc>,
    ) -> bool {
        match self.claim(project_id, path, source) {
            Some(claim) => {
                self.execute(claim, source, requested_at, RunScope::Path);
                true
            }
            None => false,
        }
    }

    /// Claim and run every path of a schedule as one batch. The schedule's last-run
    /// is set to `requested_at` after the last accepted path finishes, unless any
    /// of them failed. Paths already in flight are skipped and do not hold up the
    /// batch. Returns the number of paths accepted.
    pub fn submit_schedule(
        self: &Arc<Self>,
        schedule_id: &str,
        project_id: &str,
        paths: &[String],
        source: TriggerSource,
        requested_at: DateTime<Utc>,
    ) -> usize {
        let claims: Vec<RunClaim> = paths
            .iter()
            .filter_map(|path| self.claim(project_id, path, source))
            .collect();

        if claims.is_empty() {
            debug!(
                "Schedule {} ({}): no paths to run ({} configured)",
                schedule_id,
                source,
                paths.len()
            );
            return 0;
        }

        let accepted = claims.len();
        let batch = Arc::new(ScheduleRun {
            schedule_id: schedule_id.to_string(),
            requested_at,
            remaining: AtomicUsize::new(accepted),
            failed: AtomicBool::new(false),
        });

        for claim in claims {
            self.execute(claim, source, requested_at, RunScope::Schedule(Arc::clone(&batch)));
        }
        accepted
    }

    pub fn is_in_flight(&self, project_id: &str, path: &str) -> bool {
        self.claims
            .lock()
            .unwrap()
            .contains(&RunKey::new(project_id, path))
    }

    pub fn in_flight_count(&self) -> usize {
        self.claims.lock().unwrap().len()
    }

    /// Block until every submitted run has finished
    pub fn wait_idle(&self) {
        let pool = self.pool.lock().unwrap().clone();
        pool.join();
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    fn claim(&self, project_id: &str, path: &str, source: TriggerSource) -> Option<RunClaim> {
        let key = RunKey::new(project_id, path);
        let mut claims = self.claims.lock().unwrap();

        if !claims.insert(key.clone()) {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Skipping {} trigger for {}: run already in flight", source, key);
            return None;
        }

        Some(RunClaim {
            key,
            claims: Arc::clone(&self.claims),
        })
    }

    fn execute(
        self: &Arc<Self>,
        claim: RunClaim,
        source: TriggerSource,
        requested_at: DateTime<Utc>,
        scope: RunScope,
    ) {
        let coordinator = Arc::clone(self);
        self.pool.lock().unwrap().execute(move || {
            // Failures are logged inside run_claimed
            let _ = coordinator.run_claimed(claim, source, requested_at, scope);
        });
    }

    fn run_claimed(
        &self,
        claim: RunClaim,
        source: TriggerSource,
        requested_at: DateTime<Utc>,
        scope: RunScope,
    ) -> Result<RunOutcome, IndexWatchError> {
        let key = &claim.key;
        let _tmr = timer!(Level::Debug; "RunCoordinator::run", "{} ({})", key, source);

        let indexed = self
            .pipeline
            .index(Path::new(&key.path), &key.project_id)
            .map_err(|e| match e {
                IndexWatchError::Indexing { .. } => e,
                other => IndexWatchError::Indexing {
                    path: key.path.clone(),
                    project_id: key.project_id.clone(),
                    reason: other.to_string(),
                },
            });

        let result = match &scope {
            RunScope::Path => indexed.and_then(|()| self.record_path_success(key, requested_at)),
            RunScope::Schedule(batch) => {
                let committed = if batch.finish_path(indexed.is_err()) {
                    self.commit_schedule_run(batch)
                } else {
                    Ok(0)
                };
                indexed.and(committed)
            }
        };

        // The claim is released only after last_run has been written
        drop(claim);

        match result {
            Ok(schedules_updated) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(RunOutcome::Completed { schedules_updated })
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Indexing run ({}) failed: {}", source, e);
                Err(e)
            }
        }
    }

    fn record_path_success(
        &self,
        key: &RunKey,
        requested_at: DateTime<Utc>,
    ) -> Result<usize, IndexWatchError> {
        let conn = self.db.get_connection()?;
        let updated = Schedule::set_last_run_for_path(
            &conn,
            &key.project_id,
            &key.path,
            requested_at.timestamp(),
        )?;

        if updated == 0 {
            debug!("Run for {} completed; no schedule owns it anymore", key);
        } else {
            info!("Indexed {}; last_run updated on {} schedule(s)", key, updated);
        }
        Ok(updated)
    }

    fn commit_schedule_run(&self, batch: &ScheduleRun) -> Result<usize, IndexWatchError> {
        if batch.failed.load(Ordering::SeqCst) {
            warn!(
                "Schedule {} run had failed path(s); last_run left unchanged",
                batch.schedule_id
            );
            return Ok(0);
        }

        let conn = self.db.get_connection()?;
        if Schedule::set_last_run(&conn, &batch.schedule_id, batch.requested_at.timestamp())? {
            info!("Schedule {} run complete; last_run updated", batch.schedule_id);
            Ok(1)
        } else {
            debug!("Schedule {} run complete; schedule no longer exists", batch.schedule_id);
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedules::ScheduleSpec;
    use crate::test_support::{
        seed_project, temp_db, wait_until, FailingPipeline, GatedPipeline, RecordingPipeline,
        SelectiveFailPipeline, WAIT,
    };
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn add_schedule(db: &Database, id: &str, project_id: &str, paths: &[&str]) {
        let schedule = Schedule::from_spec(ScheduleSpec {
            id: Some(id.to_string()),
            project_id: project_id.to_string(),
            name: id.to_string(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            cron_expression: "0 0 * * *".to_string(),
        });
        db.immediate_transaction(|c| schedule.insert(c)).unwrap();
    }

    fn last_run(db: &Database, id: &str) -> Option<i64> {
        let conn = db.get_connection().unwrap();
        Schedule::get_by_id(&conn, id).unwrap().unwrap().last_run
    }

    #[test]
    fn test_trigger_success_updates_last_run() {
        let (_dir, db) = temp_db();
        seed_project(&db, "p1");
        add_schedule(&db, "s1", "p1", &["/docs"]);

        let pipeline = Arc::new(RecordingPipeline::default());
        let coordinator = RunCoordinator::new(db.clone(), pipeline.clone(), 1);

        let before = Utc::now().timestamp();
        let outcome = coordinator.trigger("p1", "/docs", TriggerSource::Manual).unwrap();
        assert_eq!(outcome, RunOutcome::Completed { schedules_updated: 1 });

        assert!(last_run(&db, "s1").unwrap() >= before);
        assert_eq!(pipeline.calls(), vec![(Path::new("/docs").to_path_buf(), "p1".to_string())]);
        assert!(!coordinator.is_in_flight("p1", "/docs"));
        assert_eq!(coordinator.stats().completed, 1);
    }

    #[test]
    fn test_failure_leaves_last_run_unchanged() {
        let (_dir, db) = temp_db();
        seed_project(&db, "p1");
        add_schedule(&db, "s1", "p1", &["/docs"]);

        let pipeline = Arc::new(FailingPipeline::default());
        let coordinator = RunCoordinator::new(db.clone(), pipeline.clone(), 1);

        let result = coordinator.trigger("p1", "/docs", TriggerSource::Cron);
        assert!(matches!(result, Err(IndexWatchError::Indexing { .. })));
        assert_eq!(last_run(&db, "s1"), None);
        assert_eq!(pipeline.attempts(), 1);
        assert_eq!(coordinator.stats().failed, 1);

        // The slot is free again; the next trigger is the retry
        assert!(!coordinator.is_in_flight("p1", "/docs"));
        assert!(coordinator.trigger("p1", "/docs", TriggerSource::Cron).is_err());
        assert_eq!(pipeline.attempts(), 2);

        // The schedule itself is untouched
        let conn = db.get_connection().unwrap();
        assert!(Schedule::get_by_id(&conn, "s1").unwrap().unwrap().enabled);
    }

    #[test]
    fn test_overlapping_trigger_is_dropped() {
        let (_dir, db) = temp_db();
        seed_project(&db, "p1");
        add_schedule(&db, "s1", "p1", &["/docs"]);

        let pipeline = Arc::new(GatedPipeline::default());
        let coordinator = Arc::new(RunCoordinator::new(db.clone(), pipeline.clone(), 2));

        assert!(coordinator.submit("p1", "/docs", TriggerSource::Cron, Utc::now()));
        assert!(pipeline.wait_started().is_some());
        assert!(coordinator.is_in_flight("p1", "/docs"));

        assert!(!coordinator.submit("p1", "/docs", TriggerSource::FileChange, Utc::now()));
        assert_eq!(
            coordinator.trigger("p1", "/docs", TriggerSource::Manual).unwrap(),
            RunOutcome::AlreadyRunning
        );

        pipeline.release();
        coordinator.wait_idle();

        assert_eq!(pipeline.calls(), 1);
        assert!(last_run(&db, "s1").is_some());
        assert!(!coordinator.is_in_flight("p1", "/docs"));
        assert_eq!(
            coordinator.stats(),
            RunStats {
                completed: 1,
                failed: 0,
                skipped: 2
            }
        );
    }

    #[test]
    fn test_distinct_pairs_run_concurrently() {
        let (_dir, db) = temp_db();
        seed_project(&db, "p1");
        seed_project(&db, "p2");

        let pipeline = Arc::new(GatedPipeline::default());
        let coordinator = Arc::new(RunCoordinator::new(db, pipeline.clone(), 2));

        assert!(coordinator.submit("p1", "/shared", TriggerSource::FileChange, Utc::now()));
        assert!(coordinator.submit("p2", "/shared", TriggerSource::FileChange, Utc::now()));
        assert!(pipeline.wait_started().is_some());
        assert!(pipeline.wait_started().is_some());
        assert_eq!(coordinator.in_flight_count(), 2);

        pipeline.release();
        pipeline.release();
        coordinator.wait_idle();
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[test]
    fn test_success_scopes_to_project_and_path() {
        let (_dir, db) = temp_db();
        seed_project(&db, "p1");
        seed_project(&db, "p2");
        add_schedule(&db, "s1", "p1", &["/docs", "/notes"]);
        add_schedule(&db, "s2", "p1", &["/docs"]);
        add_schedule(&db, "s3", "p1", &["/notes"]);
        add_schedule(&db, "s4", "p2", &["/docs"]);

        let coordinator =
            RunCoordinator::new(db.clone(), Arc::new(RecordingPipeline::default()), 1);
        let outcome = coordinator.trigger("p1", "/docs", TriggerSource::Manual).unwrap();
        assert_eq!(outcome, RunOutcome::Completed { schedules_updated: 2 });

        assert!(last_run(&db, "s1").is_some());
        assert!(last_run(&db, "s2").is_some());
        assert_eq!(last_run(&db, "s3"), None);
        assert_eq!(last_run(&db, "s4"), None);
    }

    #[test]
    fn test_run_for_deleted_schedule_is_noop() {
        let (_dir, db) = temp_db();
        seed_project(&db, "p1");
        add_schedule(&db, "s1", "p1", &["/docs"]);

        let pipeline = Arc::new(GatedPipeline::default());
        let coordinator = Arc::new(RunCoordinator::new(db.clone(), pipeline.clone(), 1));
        assert!(coordinator.submit("p1", "/docs", TriggerSource::Cron, Utc::now()));
        assert!(pipeline.wait_started().is_some());

        db.immediate_transaction(|c| Schedule::delete(c, "s1")).unwrap();
        pipeline.release();
        coordinator.wait_idle();

        let stats = coordinator.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert!(wait_until(WAIT, || coordinator.in_flight_count() == 0));
    }

    #[test]
    fn test_schedule_run_commits_only_when_every_path_succeeds() {
        let (_dir, db) = temp_db();
        seed_project(&db, "p1");
        add_schedule(&db, "s1", "p1", &["/ok", "/bad"]);
        add_schedule(&db, "s2", "p1", &["/ok"]);

        let pipeline = Arc::new(SelectiveFailPipeline::failing_on(&["/bad"]));
        let coordinator = Arc::new(RunCoordinator::new(db.clone(), pipeline.clone(), 2));

        let paths = vec!["/ok".to_string(), "/bad".to_string()];
        assert_eq!(
            coordinator.submit_schedule("s1", "p1", &paths, TriggerSource::Cron, Utc::now()),
            2
        );
        coordinator.wait_idle();

        assert_eq!(pipeline.calls(), vec![PathBuf::from("/bad"), PathBuf::from("/ok")]);
        assert_eq!(last_run(&db, "s1"), None);
        // A schedule-level run never touches other schedules sharing the path
        assert_eq!(last_run(&db, "s2"), None);
        assert_eq!(
            coordinator.stats(),
            RunStats {
                completed: 1,
                failed: 1,
                skipped: 0
            }
        );

        let requested_at = Utc::now();
        let ok = vec!["/ok".to_string()];
        assert_eq!(
            coordinator.submit_schedule("s2", "p1", &ok, TriggerSource::Manual, requested_at),
            1
        );
        coordinator.wait_idle();
        assert_eq!(last_run(&db, "s2"), Some(requested_at.timestamp()));
        assert_eq!(last_run(&db, "s1"), None);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[test]
    fn test_schedule_run_without_paths_is_noop() {
        let (_dir, db) = temp_db();
        seed_project(&db, "p1");
        add_schedule(&db, "s1", "p1", &[]);

        let pipeline = Arc::new(RecordingPipeline::default());
        let coordinator = Arc::new(RunCoordinator::new(db.clone(), pipeline.clone(), 1));
        assert_eq!(
            coordinator.submit_schedule("s1", "p1", &[], TriggerSource::Cron, Utc::now()),
            0
        );
        coordinator.wait_idle();

        assert_eq!(pipeline.count(), 0);
        assert_eq!(last_run(&db, "s1"), None);
        assert_eq!(coordinator.stats(), RunStats::default());
    }
}
