use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerSettings;

pub const CONFIG_FILENAME: &str = "config.toml";
const ENV_PREFIX: &str = "INDEXWATCH_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub indexwatch: String,
    pub notify: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const INDEXWATCH_LEVEL: &str = "info";
    const NOTIFY_LEVEL: &str = "warn";

    fn default() -> Self {
        LoggingConfig {
            indexwatch: Self::INDEXWATCH_LEVEL.to_string(),
            notify: Self::NOTIFY_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        Self::ensure_level("indexwatch", &mut self.indexwatch, Self::INDEXWATCH_LEVEL);
        Self::ensure_level("notify", &mut self.notify, Self::NOTIFY_LEVEL);
    }

    // Trim and lowercase the level; fall back to the default if it isn't a known level
    fn ensure_level(name: &str, level: &mut String, default: &str) {
        let str_original = level.clone();
        *level = level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&level.as_str()) {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                name, str_original, default
            );
            *level = default.to_owned();
        }
    }

    /// flexi_logger spec string, e.g. "warn, indexwatch=info, notify=warn"
    pub fn log_spec(&self) -> String {
        format!(
            "warn, indexwatch={}, notify={}, notify_debouncer_mini={}",
            self.indexwatch, self.notify, self.notify
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Directory holding the database file. Defaults to the data directory.
    pub dir: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    const MAX_CONNECTIONS: u32 = 8;
    const MAX_CONNECTIONS_RANGE: (u32, u32) = (1, 32);

    fn default() -> Self {
        DatabaseConfig {
            dir: None,
            max_connections: Self::MAX_CONNECTIONS,
        }
    }

    fn ensure_valid(&mut self) {
        let (min, max) = Self::MAX_CONNECTIONS_RANGE;
        if !(min..=max).contains(&self.max_connections) {
            eprintln!(
                "Config error: database max_connections of {} is out of range ({}-{}) - using default of {}",
                self.max_connections,
                min,
                max,
                Self::MAX_CONNECTIONS
            );
            self.max_connections = Self::MAX_CONNECTIONS;
        }

        if let Some(dir) = &self.dir {
            if dir.trim().is_empty() {
                self.dir = None;
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub worker_threads: usize,
    pub debounce_ms: u64,
}

impl SchedulerConfig {
    const WORKER_THREADS: usize = 2;
    const WORKER_THREADS_RANGE: (usize, usize) = (1, 64);
    const DEBOUNCE_MS: u64 = 500;
    const DEBOUNCE_MS_RANGE: (u64, u64) = (50, 60_000);

    fn default() -> Self {
        SchedulerConfig {
            worker_threads: Self::WORKER_THREADS,
            debounce_ms: Self::DEBOUNCE_MS,
        }
    }

    fn ensure_valid(&mut self) {
        let (min, max) = Self::WORKER_THREADS_RANGE;
        if !(min..=max).contains(&self.worker_threads) {
            eprintln!(
                "Config error: scheduler worker_threads of {} is out of range ({}-{}) - using default of {}",
                self.worker_threads,
                min,
                max,
                Self::WORKER_THREADS
            );
            self.worker_threads = Self::WORKER_THREADS;
        }

        let (min, max) = Self::DEBOUNCE_MS_RANGE;
        if !(min..=max).contains(&self.debounce_ms) {
            eprintln!(
                "Config error: scheduler debounce_ms of {} is out of range ({}-{}) - using default of {}",
                self.debounce_ms,
                min,
                max,
                Self::DEBOUNCE_MS
            );
            self.debounce_ms = Self::DEBOUNCE_MS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from config.toml in the app's data directory, with
    /// INDEXWATCH_-prefixed environment variables layered on top.
    /// Writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        Self::load_in_dir(project_dirs.data_local_dir())
    }

    /// Same as `load_config`, for an explicit data directory
    pub fn load_in_dir(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILENAME);

        if !config_path.exists() {
            Self::write_default(&config_path);
        }

        Self::load_from_path(&config_path)
    }

    /// Defaults, then the TOML file (if it exists), then the environment.
    /// On error the defaults are used.
    pub fn load_from_path(config_path: &Path) -> Self {
        let default_config = Config::default();

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        if let Ok(toml_string) = toml::to_string_pretty(&Config::default()) {
            if let Err(e) = fs::write(config_path, toml_string) {
                eprintln!(
                    "Failed to write default config to {}: {}",
                    config_path.display(),
                    e
                );
            }
        } else {
            eprintln!("Failed to serialize default config.");
        }
    }

    /// Directory for the database file: the configured dir, else `data_dir`
    pub fn database_dir(&self, data_dir: &Path) -> PathBuf {
        match &self.database.dir {
            Some(dir) => PathBuf::from(dir),
            None => data_dir.to_path_buf(),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            worker_threads: self.scheduler.worker_threads,
            debounce: Duration::from_millis(self.scheduler.debounce_ms),
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.scheduler.ensure_valid();
    }
}
