use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::info;

use crate::config::Config;
use crate::database::Database;
use crate::dispatch::CronExpr;
use crate::error::IndexWatchError;
use crate::logging::init_logging;
use crate::pipeline::DryRunPipeline;
use crate::projects::Project;
use crate::run_coordinator::{RunCoordinator, RunOutcome, TriggerSource};
use crate::scheduler::SchedulerService;

#[derive(Parser)]
#[command(
    name = "indexwatch",
    version,
    about = "indexwatch: keeps project documents indexed on schedules and file changes"
)]
pub struct Cli {
    /// Directory for config, logs and the database (default: platform data directory)
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler until interrupted (default if no command specified)
    Run,

    /// Print the next fire times of a cron expression
    #[command(name = "next-runs")]
    NextRuns {
        /// Cron expression, e.g. "*/15 9-17 * * 1-5" or "@daily"
        expression: String,

        /// Number of fire times to print
        #[arg(long = "count", short = 'n', default_value_t = 5)]
        count: usize,
    },

    /// Index one path of a project now and record the run on the schedules that own it
    Index {
        /// Id of the project the path belongs to
        #[arg(long = "project", short = 'p')]
        project_id: String,

        /// File or directory to index
        path: String,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), IndexWatchError> {
        let args = Cli::parse();

        // Default to Run if no command specified
        match args.command.unwrap_or(Command::Run) {
            Command::Run => Self::run_scheduler(args.data_dir),
            Command::NextRuns { expression, count } => Self::print_next_runs(&expression, count),
            Command::Index { project_id, path } => {
                Self::run_index(args.data_dir, &project_id, &path)
            }
        }
    }

    /// Resolve the data directory and load its configuration
    fn load_config(data_dir: Option<PathBuf>) -> Result<(PathBuf, Config), IndexWatchError> {
        match data_dir {
            Some(dir) => {
                let config = Config::load_in_dir(&dir);
                Ok((dir, config))
            }
            None => {
                let project_dirs = ProjectDirs::from("", "", "indexwatch").ok_or_else(|| {
                    IndexWatchError::Error("Could not determine the data directory".to_string())
                })?;
                let config = Config::load_config(&project_dirs);
                Ok((project_dirs.data_local_dir().to_path_buf(), config))
            }
        }
    }

    fn open_database(data_dir: &Path, config: &Config) -> Result<Database, IndexWatchError> {
        let db = Database::open_in_dir(
            &config.database_dir(data_dir),
            config.database.max_connections,
        )?;
        info!("Opened database {}", db.path().display());
        Ok(db)
    }

    fn run_scheduler(data_dir: Option<PathBuf>) -> Result<(), IndexWatchError> {
        let (data_dir, config) = Self::load_config(data_dir)?;
        let _logger = init_logging(&data_dir, &config.logging)?;
        let db = Self::open_database(&data_dir, &config)?;

        let service = SchedulerService::new(db, Arc::new(DryRunPipeline), config.scheduler_settings());
        service.start()?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| IndexWatchError::Error(format!("Failed to create runtime: {}", e)))?;

        let signal = rt.block_on(tokio::signal::ctrl_c());

        info!("Shutting down");
        service.shutdown();
        signal?;

        Ok(())
    }

    fn run_index(
        data_dir: Option<PathBuf>,
        project_id: &str,
        path: &str,
    ) -> Result<(), IndexWatchError> {
        let (data_dir, config) = Self::load_config(data_dir)?;
        let _logger = init_logging(&data_dir, &config.logging)?;
        let db = Self::open_database(&data_dir, &config)?;

        match Self::index_path(db, project_id, path)? {
            RunOutcome::Completed { schedules_updated } => println!(
                "Indexed '{}'; last run recorded on {} schedule(s)",
                path, schedules_updated
            ),
            RunOutcome::AlreadyRunning => println!("'{}' is already being indexed", path),
        }
        Ok(())
    }

    fn index_path(db: Database, project_id: &str, path: &str) -> Result<RunOutcome, IndexWatchError> {
        let conn = db.get_connection()?;
        if !Project::exists(&conn, project_id)? {
            return Err(IndexWatchError::ProjectNotFound(project_id.to_string()));
        }
        drop(conn);

        let coordinator = RunCoordinator::new(db, Arc::new(DryRunPipeline), 1);
        coordinator.trigger(project_id, path, TriggerSource::Manual)
    }

    fn print_next_runs(expression: &str, count: usize) -> Result<(), IndexWatchError> {
        let expr = CronExpr::parse(expression)?;

        let upcoming = expr.upcoming(Local::now(), count);
        if upcoming.is_empty() {
            println!("'{}' has no upcoming fire times", expr);
        }
        for fire_time in upcoming {
            println!("{}", fire_time.format("%a %Y-%m-%d %H:%M:%S %:z"));
        }

        Ok(())
    }
}
