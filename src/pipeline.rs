use log::{debug, info};
use std::fs;
use std::path::Path;

use crate::error::IndexWatchError;

/// The document-to-embedding work for one path.
///
/// Implementations are called from worker threads and may block for as long as
/// indexing takes. A returned error is logged by the caller and leaves the
/// schedules' last-run untouched.
pub trait IndexingPipeline: Send + Sync {
    fn index(&self, path: &Path, project_id: &str) -> Result<(), IndexWatchError>;
}

/// Walks the target and reports what would be indexed without writing anything
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunPipeline;

impl IndexingPipeline for DryRunPipeline {
    fn index(&self, path: &Path, project_id: &str) -> Result<(), IndexWatchError> {
        let metadata = fs::metadata(path).map_err(|e| IndexWatchError::Indexing {
            path: path.display().to_string(),
            project_id: project_id.to_string(),
            reason: e.to_string(),
        })?;

        let files = if metadata.is_dir() {
            count_visible_files(path)?
        } else {
            1
        };

        info!(
            "Dry run: {} file(s) under '{}' for project {}",
            files,
            path.display(),
            project_id
        );
        Ok(())
    }
}

fn count_visible_files(dir: &Path) -> Result<u64, IndexWatchError> {
    let mut count = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            count += count_visible_files(&entry.path())?;
        } else if file_type.is_file() {
            count += 1;
        } else {
            debug!("Skipping special entry '{}'", entry.path().display());
        }
    }

    Ok(count)
}
