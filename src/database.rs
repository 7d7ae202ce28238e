use log::{debug, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::IndexWatchError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

pub const DB_FILENAME: &str = "indexwatch.db";

// busy_timeout goes first so that concurrent pool connections switching to WAL wait instead of failing
const CONNECTION_INIT_SQL: &str = "
PRAGMA busy_timeout = 5000;
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
";

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Pooled handle to the application database. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl Database {
    pub fn open(db_path: &Path, max_connections: u32) -> Result<Self, IndexWatchError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch(CONNECTION_INIT_SQL));

        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .min_idle(Some(1))
            .build(manager)?;

        let db = Database {
            pool,
            path: db_path.to_path_buf(),
        };

        {
            let conn = db.get_connection()?;
            Self::ensure_schema(&conn)?;
        }

        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    /// Open `indexwatch.db` inside `db_dir`, creating the folder if needed
    pub fn open_in_dir(db_dir: &Path, max_connections: u32) -> Result<Self, IndexWatchError> {
        Self::open(&db_dir.join(DB_FILENAME), max_connections)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_connection(&self) -> Result<DbConnection, IndexWatchError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    /// Commits when `f` returns Ok, rolls back (on drop) when it returns Err.
    pub fn immediate_transaction<T, F>(&self, f: F) -> Result<T, IndexWatchError>
    where
        F: FnOnce(&Connection) -> Result<T, IndexWatchError>,
    {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn ensure_schema(conn: &Connection) -> Result<(), IndexWatchError> {
        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            debug!("Creating schema version {}", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(IndexWatchError::Error(format!(
                "Schema version mismatch: database has {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(IndexWatchError::Error("Schema version missing".to_string())),
        }
    }
}
