//! Pipeline doubles and database helpers shared by the unit tests.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::database::Database;
use crate::error::IndexWatchError;
use crate::pipeline::IndexingPipeline;
use crate::projects::Project;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn temp_db() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let db = Database::open_in_dir(dir.path(), 4).unwrap();
    (dir, db)
}

pub fn seed_project(db: &Database, id: &str) {
    db.immediate_transaction(|c| Project::create(c, id, &format!("Project {}", id), None, &[]))
        .unwrap();
}

pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Succeeds immediately and records every call
#[derive(Default)]
pub struct RecordingPipeline {
    calls: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingPipeline {
    pub fn calls(&self) -> Vec<(PathBuf, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl IndexingPipeline for RecordingPipeline {
    fn index(&self, path: &Path, project_id: &str) -> Result<(), IndexWatchError> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), project_id.to_string()));
        Ok(())
    }
}

/// Always fails
#[derive(Default)]
pub struct FailingPipeline {
    attempts: AtomicUsize,
}

impl FailingPipeline {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl IndexingPipeline for FailingPipeline {
    fn index(&self, path: &Path, project_id: &str) -> Result<(), IndexWatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(IndexWatchError::Indexing {
            path: path.display().to_string(),
            project_id: project_id.to_string(),
            reason: "embedding service unavailable".to_string(),
        })
    }
}

/// Blocks every call until `release` is called, announcing each start
pub struct GatedPipeline {
    calls: AtomicUsize,
    started_tx: Sender<(PathBuf, String)>,
    started_rx: Receiver<(PathBuf, String)>,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
}

impl Default for GatedPipeline {
    fn default() -> Self {
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        GatedPipeline {
            calls: AtomicUsize::new(0),
            started_tx,
            started_rx,
            release_tx,
            release_rx,
        }
    }
}

impl GatedPipeline {
    pub fn wait_started(&self) -> Option<(PathBuf, String)> {
        self.started_rx.recv_timeout(WAIT).ok()
    }

    pub fn release(&self) {
        let _ = self.release_tx.send(());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IndexingPipeline for GatedPipeline {
    fn index(&self, path: &Path, project_id: &str) -> Result<(), IndexWatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .started_tx
            .send((path.to_path_buf(), project_id.to_string()));
        self.release_rx
            .recv_timeout(WAIT)
            .map_err(|e| IndexWatchError::Error(format!("gate never released: {}", e)))
    }
}

/// Fails for the listed paths and succeeds for every other, recording each call
pub struct SelectiveFailPipeline {
    failing: Vec<PathBuf>,
    calls: Mutex<Vec<PathBuf>>,
}

impl SelectiveFailPipeline {
    pub fn failing_on<P: AsRef<Path>>(paths: &[P]) -> Self {
        SelectiveFailPipeline {
            failing: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Called paths, sorted
    pub fn calls(&self) -> Vec<PathBuf> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

impl IndexingPipeline for SelectiveFailPipeline {
    fn index(&self, path: &Path, project_id: &str) -> Result<(), IndexWatchError> {
        self.calls.lock().unwrap().push(path.to_path_buf());
        if self.failing.iter().any(|failing| failing == path) {
            return Err(IndexWatchError::Indexing {
                path: path.display().to_string(),
                project_id: project_id.to_string(),
                reason: "parser crashed".to_string(),
            });
        }
        Ok(())
    }
}
