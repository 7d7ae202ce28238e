//! The scheduler service: owns every cron timer and filesystem watcher.
//!
//! All mutating operations serialize on the registry lock. A new cron timer is
//! started before the database write and registered only after it commits, so a
//! failed write leaves runtime dispatch as it was and a committed schedule always
//! has its timer. Dispatch callbacks never take the registry lock; they only
//! claim and submit work to the [`RunCoordinator`].
//!
//! Lock order: registry, then a path's owner set. A watcher is never closed while
//! its owner set is locked, since the watcher callback takes that lock while
//! holding the watcher's fire gate.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::database::Database;
use crate::dispatch::{CronDispatcher, CronExpr, WatchDispatcher};
use crate::error::IndexWatchError;
use crate::pipeline::IndexingPipeline;
use crate::projects::Project;
use crate::run_coordinator::{RunCoordinator, TriggerSource};
use crate::schedules::{Schedule, ScheduleSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub worker_threads: usize,
    pub debounce: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            worker_threads: 2,
            debounce: Duration::from_millis(500),
        }
    }
}

/// Runtime state of a schedule within one service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Unloaded,
    Enabled,
    Disabled,
    Removed,
}

/// schedule id -> project id
type OwnerSet = Arc<Mutex<BTreeMap<String, String>>>;

struct CronEntry {
    paths: Vec<String>,
    dispatcher: CronDispatcher,
}

struct WatchEntry {
    owners: OwnerSet,
    // None when the OS watch could not be established
    dispatcher: Option<WatchDispatcher>,
}

#[derive(Default)]
struct Registry {
    crons: HashMap<String, CronEntry>,
    watchers: HashMap<String, WatchEntry>,
    states: HashMap<String, ScheduleState>,
    shut_down: bool,
}

impl Registry {
    fn check_shutting_down(&self) -> Result<(), IndexWatchError> {
        if self.shut_down {
            return Err(IndexWatchError::ShuttingDown);
        }
        Ok(())
    }
}

pub struct SchedulerService {
    db: Database,
    coordinator: Arc<RunCoordinator>,
    debounce: Duration,
    registry: Mutex<Registry>,
}

impl fmt::Debug for SchedulerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerService")
            .field("db", &self.db)
            .field("active_crons", &self.active_cron_count())
            .field("active_watchers", &self.active_watcher_count())
            .finish()
    }
}

impl SchedulerService {
    pub fn new(
        db: Database,
        pipeline: Arc<dyn IndexingPipeline>,
        settings: SchedulerSettings,
    ) -> Self {
        let coordinator = Arc::new(RunCoordinator::new(
            db.clone(),
            pipeline,
            settings.worker_threads,
        ));

        SchedulerService {
            db,
            coordinator,
            debounce: settings.debounce,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Activate every enabled schedule that is not already active.
    /// Returns the number of schedules activated.
    pub fn start(&self) -> Result<usize, IndexWatchError> {
        let mut registry = self.registry.lock().unwrap();
        registry.check_shutting_down()?;

        let conn = self.db.get_connection()?;
        let schedules = Schedule::list_enabled(&conn)?;
        drop(conn);

        let mut activated = 0;
        for schedule in schedules {
            if registry.crons.contains_key(&schedule.id) {
                continue;
            }

            let started = CronExpr::parse(&schedule.cron_expression)
                .and_then(|expr| self.start_cron(&schedule, expr));
            match started {
                Ok(dispatcher) => {
                    self.register_locked(&mut registry, &schedule, dispatcher);
                    activated += 1;
                }
                Err(e) => error!("Skipping schedule {} ({}): {}", schedule.id, schedule.name, e),
            }
        }

        info!("Scheduler started with {} active schedule(s)", activated);
        Ok(activated)
    }

    pub fn add_schedule(&self, spec: ScheduleSpec) -> Result<Schedule, IndexWatchError> {
        let mut registry = self.registry.lock().unwrap();
        registry.check_shutting_down()?;

        let schedule = Schedule::from_spec(spec);
        let expr = schedule.validate()?;

        // Dropped, and so stopped, if the write fails
        let dispatcher = self.start_cron(&schedule, expr)?;

        self.db.immediate_transaction(|conn| {
            if !Project::exists(conn, &schedule.project_id)? {
                return Err(IndexWatchError::ProjectNotFound(schedule.project_id.clone()));
            }
            schedule.insert(conn)
        })?;

        self.register_locked(&mut registry, &schedule, dispatcher);
        info!(
            "Added schedule {} ({}) for project {}",
            schedule.id, schedule.name, schedule.project_id
        );
        Ok(schedule)
    }

    /// Replace a schedule's definition, keeping its id, enabled flag, last run and
    /// creation time.
    pub fn update_schedule(&self, id: &str, spec: ScheduleSpec) -> Result<Schedule, IndexWatchError> {
        let mut registry = self.registry.lock().unwrap();
        registry.check_shutting_down()?;

        let existing = self
            .get_schedule(id)?
            .ok_or_else(|| IndexWatchError::ScheduleNotFound(id.to_string()))?;

        let mut updated = Schedule::from_spec(ScheduleSpec {
            id: Some(id.to_string()),
            ..spec
        });
        updated.enabled = existing.enabled;
        updated.last_run = existing.last_run;
        updated.created = existing.created;

        let expr = updated.validate()?;
        let dispatcher = if updated.enabled {
            Some(self.start_cron(&updated, expr)?)
        } else {
            None
        };

        self.db.immediate_transaction(|conn| {
            if !Project::exists(conn, &updated.project_id)? {
                return Err(IndexWatchError::ProjectNotFound(updated.project_id.clone()));
            }
            Schedule::delete(conn, id)?;
            updated.insert(conn)
        })?;

        self.deactivate_locked(&mut registry, id);
        match dispatcher {
            Some(dispatcher) => self.register_locked(&mut registry, &updated, dispatcher),
            None => {
                registry
                    .states
                    .insert(id.to_string(), ScheduleState::Disabled);
            }
        }

        info!("Updated schedule {} ({})", updated.id, updated.name);
        Ok(updated)
    }

    pub fn remove_schedule(&self, id: &str) -> Result<(), IndexWatchError> {
        let mut registry = self.registry.lock().unwrap();
        registry.check_shutting_down()?;

        self.db
            .immediate_transaction(|conn| Schedule::delete(conn, id))?;

        self.deactivate_locked(&mut registry, id);
        registry.states.insert(id.to_string(), ScheduleState::Removed);
        info!("Removed schedule {}", id);
        Ok(())
    }

    /// Flip a schedule between enabled and disabled. Returns the new enabled flag.
    pub fn toggle_schedule(&self, id: &str) -> Result<bool, IndexWatchError> {
        let mut registry = self.registry.lock().unwrap();
        registry.check_shutting_down()?;

        let mut schedule = self
            .get_schedule(id)?
            .ok_or_else(|| IndexWatchError::ScheduleNotFound(id.to_string()))?;
        schedule.enabled = !schedule.enabled;

        let dispatcher = if schedule.enabled {
            let expr = CronExpr::parse(&schedule.cron_expression)?;
            Some(self.start_cron(&schedule, expr)?)
        } else {
            None
        };

        self.db
            .immediate_transaction(|conn| Schedule::set_enabled(conn, id, schedule.enabled))?;

        self.deactivate_locked(&mut registry, id);
        match dispatcher {
            Some(dispatcher) => {
                self.register_locked(&mut registry, &schedule, dispatcher);
                info!("Enabled schedule {}", id);
            }
            None => {
                registry
                    .states
                    .insert(id.to_string(), ScheduleState::Disabled);
                info!("Disabled schedule {}", id);
            }
        }

        Ok(schedule.enabled)
    }

    /// Run all of the schedule's paths as one batch, enabled or not. last_run is
    /// recorded only if every path succeeds.
    /// Returns the number of runs accepted; paths already in flight are skipped.
    pub fn trigger_schedule(&self, id: &str) -> Result<usize, IndexWatchError> {
        self.registry.lock().unwrap().check_shutting_down()?;

        let schedule = self
            .get_schedule(id)?
            .ok_or_else(|| IndexWatchError::ScheduleNotFound(id.to_string()))?;

        let accepted = self.coordinator.submit_schedule(
            &schedule.id,
            &schedule.project_id,
            &schedule.paths,
            TriggerSource::Manual,
            Utc::now(),
        );

        info!(
            "Manual trigger of schedule {}: {} of {} path(s) submitted",
            id,
            accepted,
            schedule.paths.len()
        );
        Ok(accepted)
    }

    /// Delete a project with all of its schedules and tear down their dispatch.
    /// Returns the number of schedules removed.
    pub fn remove_project(&self, project_id: &str) -> Result<usize, IndexWatchError> {
        let mut registry = self.registry.lock().unwrap();
        registry.check_shutting_down()?;

        let schedule_ids = self.db.immediate_transaction(|conn| {
            let ids: Vec<String> = Schedule::list_for_project(conn, project_id)?
                .into_iter()
                .map(|s| s.id)
                .collect();
            Project::delete(conn, project_id)?;
            Ok(ids)
        })?;

        for id in &schedule_ids {
            self.deactivate_locked(&mut registry, id);
            registry.states.insert(id.clone(), ScheduleState::Removed);
        }

        info!(
            "Removed project {} and {} schedule(s)",
            project_id,
            schedule_ids.len()
        );
        Ok(schedule_ids.len())
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>, IndexWatchError> {
        let conn = self.db.get_connection()?;
        Schedule::list(&conn)
    }

    pub fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, IndexWatchError> {
        let conn = self.db.get_connection()?;
        Schedule::get_by_id(&conn, id)
    }

    /// Stop all dispatch, refuse further changes and wait for in-flight runs.
    pub fn shutdown(&self) {
        {
            let mut registry = self.registry.lock().unwrap();
            if !registry.shut_down {
                registry.shut_down = true;

                for (_, mut entry) in registry.crons.drain() {
                    entry.dispatcher.stop();
                }
                for (_, mut entry) in registry.watchers.drain() {
                    if let Some(dispatcher) = entry.dispatcher.as_mut() {
                        dispatcher.close();
                    }
                }
                info!("Scheduler stopped all dispatch");
            }
        }

        self.coordinator.wait_idle();
    }

    pub fn is_shut_down(&self) -> bool {
        self.registry.lock().unwrap().shut_down
    }

    pub fn schedule_state(&self, id: &str) -> ScheduleState {
        self.registry
            .lock()
            .unwrap()
            .states
            .get(id)
            .copied()
            .unwrap_or(ScheduleState::Unloaded)
    }

    pub fn active_cron_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap()
            .crons
            .values()
            .filter(|entry| entry.dispatcher.is_running())
            .count()
    }

    /// Number of paths with a live OS watch
    pub fn active_watcher_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap()
            .watchers
            .values()
            .filter(|entry| entry.dispatcher.is_some())
            .count()
    }

    pub fn is_watching(&self, path: &str) -> bool {
        self.registry
            .lock()
            .unwrap()
            .watchers
            .get(path)
            .map(|entry| entry.dispatcher.is_some())
            .unwrap_or(false)
    }

    pub fn watch_owner_count(&self, path: &str) -> usize {
        self.registry
            .lock()
            .unwrap()
            .watchers
            .get(path)
            .map(|entry| entry.owners.lock().unwrap().len())
            .unwrap_or(0)
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.coordinator
    }

    /// Start a schedule's cron timer. Each tick runs all of its paths as one batch.
    fn start_cron(&self, schedule: &Schedule, expr: CronExpr) -> Result<CronDispatcher, IndexWatchError> {
        let mut dispatcher = CronDispatcher::new(schedule.id.clone(), expr);

        let coordinator = Arc::clone(&self.coordinator);
        let schedule_id = schedule.id.clone();
        let project_id = schedule.project_id.clone();
        let paths = schedule.paths.clone();
        dispatcher.start(move |fired_at| {
            coordinator.submit_schedule(
                &schedule_id,
                &project_id,
                &paths,
                TriggerSource::Cron,
                fired_at.with_timezone(&Utc),
            );
        })?;

        Ok(dispatcher)
    }

    /// Register a started cron timer and attach the schedule to each of its paths' watchers
    fn register_locked(&self, registry: &mut Registry, schedule: &Schedule, dispatcher: CronDispatcher) {
        for path in &schedule.paths {
            let entry = registry
                .watchers
                .entry(path.clone())
                .or_insert_with(|| self.open_watch(path));
            entry
                .owners
                .lock()
                .unwrap()
                .insert(schedule.id.clone(), schedule.project_id.clone());
        }

        registry.crons.insert(
            schedule.id.clone(),
            CronEntry {
                paths: schedule.paths.clone(),
                dispatcher,
            },
        );
        registry
            .states
            .insert(schedule.id.clone(), ScheduleState::Enabled);
    }

    /// Stop a schedule's cron timer and release its paths. Returns false when it
    /// had no active dispatch.
    fn deactivate_locked(&self, registry: &mut Registry, id: &str) -> bool {
        let mut entry = match registry.crons.remove(id) {
            Some(entry) => entry,
            None => return false,
        };
        entry.dispatcher.stop();

        for path in &entry.paths {
            let now_unowned = match registry.watchers.get(path) {
                Some(watch) => {
                    let mut owners = watch.owners.lock().unwrap();
                    owners.remove(id);
                    owners.is_empty()
                }
                None => false,
            };

            if now_unowned {
                if let Some(mut watch) = registry.watchers.remove(path) {
                    if let Some(dispatcher) = watch.dispatcher.as_mut() {
                        dispatcher.close();
                    }
                    debug!("Closed watcher on {}", path);
                }
            }
        }

        true
    }

    /// Start watching a path. Failure is logged and leaves the entry without an OS watch.
    fn open_watch(&self, path: &str) -> WatchEntry {
        let owners: OwnerSet = Arc::new(Mutex::new(BTreeMap::new()));

        let coordinator = Arc::clone(&self.coordinator);
        let callback_owners = Arc::clone(&owners);
        let key = path.to_string();

        let dispatcher = WatchDispatcher::start(Path::new(path), self.debounce, move |_root| {
            let projects: BTreeSet<String> =
                callback_owners.lock().unwrap().values().cloned().collect();
            let requested_at = Utc::now();
            for project_id in &projects {
                coordinator.submit(project_id, &key, TriggerSource::FileChange, requested_at);
            }
        });

        match dispatcher {
            Ok(dispatcher) => {
                debug!("Watching {}", path);
                WatchEntry {
                    owners,
                    dispatcher: Some(dispatcher),
                }
            }
            Err(e) => {
                warn!("{}; continuing without a watcher", e);
                WatchEntry {
                    owners,
                    dispatcher: None,
                }
            }
        }
    }
}
