//! Filesystem watcher for one schedule path.
//!
//! Uses `notify` through `notify-debouncer-mini`, so a burst of changes under the
//! watched root is delivered as a single callback carrying the root path. Changes to
//! hidden entries (any component starting with `.` below the root) are ignored.

use log::{trace, warn};
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::IndexWatchError;

pub struct WatchDispatcher {
    path: PathBuf,
    gate: Arc<Mutex<bool>>,
    debouncer: Option<Debouncer<RecommendedWatcher>>,
}

impl fmt::Debug for WatchDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchDispatcher")
            .field("path", &self.path)
            .field("active", &self.is_active())
            .finish()
    }
}

impl WatchDispatcher {
    pub fn start<F>(
        path: impl Into<PathBuf>,
        debounce: Duration,
        on_change: F,
    ) -> Result<Self, IndexWatchError>
    where
        F: Fn(&Path) + Send + 'static,
    {
        let path = path.into();
        let gate = Arc::new(Mutex::new(true));

        let root = path.clone();
        let handler_gate = Arc::clone(&gate);

        let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    if !has_visible_change(&root, &events) {
                        trace!("Ignoring hidden-only changes under {}", root.display());
                        return;
                    }
                    let open = handler_gate.lock().unwrap_or_else(PoisonError::into_inner);
                    if *open {
                        on_change(&root);
                    }
                }
                Err(e) => warn!("Watch error on {}: {:?}", root.display(), e),
            }
        })
        .map_err(|e| IndexWatchError::WatchError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        debouncer
            .watcher()
            .watch(&path, RecursiveMode::Recursive)
            .map_err(|e| IndexWatchError::WatchError {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        Ok(WatchDispatcher {
            path,
            gate,
            debouncer: Some(debouncer),
        })
    }

    /// Stop event delivery and release the OS watch. Idempotent.
    pub fn close(&mut self) {
        // Waits for a callback that is already running
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = false;

        if let Some(mut debouncer) = self.debouncer.take() {
            if let Err(e) = debouncer.watcher().unwatch(&self.path) {
                // The path may already be gone; the watch is released when the debouncer drops
                warn!("Failed to unwatch {}: {}", self.path.display(), e);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.debouncer.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WatchDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn has_visible_change(root: &Path, events: &[DebouncedEvent]) -> bool {
    events.iter().any(|event| !is_hidden(root, &event.path))
}

/// True when `changed` lies under a dotfile or dot-directory below `root`
fn is_hidden(root: &Path, changed: &Path) -> bool {
    let relative = match changed.strip_prefix(root) {
        Ok(relative) => relative,
        // Paths reported outside the root (symlinks, canonicalization): judge the file name only
        Err(_) => {
            return changed
                .file_name()
                .map(|name| name.to_string_lossy().starts_with('.'))
                .unwrap_or(false)
        }
    };

    relative.components().any(|component| match component {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}
