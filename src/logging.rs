use std::path::Path;

use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};

use crate::config::LoggingConfig;
use crate::error::IndexWatchError;

const LOG_BASENAME: &str = "indexwatch";
const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 7;

/// Start file logging under `<data_dir>/logs`. Warnings and errors are also
/// written to stderr. The returned handle must be kept alive for the process.
pub fn init_logging(data_dir: &Path, config: &LoggingConfig) -> Result<LoggerHandle, IndexWatchError> {
    let handle = Logger::try_with_str(config.log_spec())?
        .log_to_file(
            FileSpec::default()
                .directory(data_dir.join("logs"))
                .basename(LOG_BASENAME),
        )
        .rotate(
            Criterion::Size(LOG_ROTATE_BYTES),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(LOG_FILES_KEPT),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_files(detailed_format)
        .start()?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexi_logger::LogSpecification;

    #[test]
    fn test_log_spec_parses() {
        let config = LoggingConfig {
            indexwatch: "trace".to_string(),
            notify: "error".to_string(),
        };
        assert!(LogSpecification::parse(config.log_spec()).is_ok());
    }
}
