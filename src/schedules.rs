use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::dispatch::CronExpr;
use crate::error::IndexWatchError;

/// Parameters for creating or replacing a schedule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Generated when absent on add; ignored on update
    pub id: Option<String>,
    pub project_id: String,
    pub name: String,
    pub paths: Vec<String>,
    pub cron_expression: String,
}

/// A cron-triggered, path-watched indexing job bound to one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub paths: Vec<String>,
    pub cron_expression: String,
    pub enabled: bool,
    pub last_run: Option<i64>, // Unix timestamp (UTC)
    pub created: i64,          // Unix timestamp (UTC)
}

impl Schedule {
    /// Build an enabled, never-run schedule from a spec.
    /// Paths are trimmed and de-duplicated keeping the first occurrence.
    pub fn from_spec(spec: ScheduleSpec) -> Self {
        let id = spec
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut paths: Vec<String> = Vec::with_capacity(spec.paths.len());
        for path in spec.paths {
            let path = path.trim().to_string();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        Schedule {
            id,
            project_id: spec.project_id.trim().to_string(),
            name: spec.name.trim().to_string(),
            paths,
            cron_expression: spec.cron_expression.trim().to_string(),
            enabled: true,
            last_run: None,
            created: chrono::Utc::now().timestamp(),
        }
    }

    /// Validate the schedule and return its parsed cron expression
    pub fn validate(&self) -> Result<CronExpr, IndexWatchError> {
        if self.project_id.is_empty() {
            return Err(IndexWatchError::InvalidSchedule(
                "project_id cannot be empty".to_string(),
            ));
        }
        if self.name.is_empty() {
            return Err(IndexWatchError::InvalidSchedule(
                "name cannot be empty".to_string(),
            ));
        }
        if self.paths.is_empty() {
            return Err(IndexWatchError::InvalidSchedule(
                "at least one path is required".to_string(),
            ));
        }
        if self.paths.iter().any(|p| p.is_empty()) {
            return Err(IndexWatchError::InvalidSchedule(
                "paths cannot be empty".to_string(),
            ));
        }

        CronExpr::parse(&self.cron_expression)
    }

    // ========================================
    // Database operations
    // ========================================

    /// Insert the schedule row, then one row per path.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn insert(&self, conn: &Connection) -> Result<(), IndexWatchError> {
        conn.execute(
            "INSERT INTO schedules (id, project_id, name, cron_expression, enabled, last_run, created)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                self.id,
                self.project_id,
                self.name,
                self.cron_expression,
                self.enabled,
                self.last_run,
                self.created,
            ],
        )?;

        for path in &self.paths {
            conn.execute(
                "INSERT INTO schedule_paths (schedule_id, path) VALUES (?, ?)",
                rusqlite::params![self.id, path],
            )?;
        }

        Ok(())
    }

    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Self>, IndexWatchError> {
        let schedule = conn
            .query_row(
                "SELECT id, project_id, name, cron_expression, enabled, last_run, created
                 FROM schedules
                 WHERE id = ?",
                [id],
                Self::from_row,
            )
            .optional()?;

        match schedule {
            Some(mut schedule) => {
                schedule.paths = Self::paths_for(conn, &schedule.id)?;
                Ok(Some(schedule))
            }
            None => Ok(None),
        }
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, IndexWatchError> {
        Self::query_with_paths(
            conn,
            "SELECT id, project_id, name, cron_expression, enabled, last_run, created
             FROM schedules
             ORDER BY created, id",
            rusqlite::params![],
        )
    }

    pub fn list_enabled(conn: &Connection) -> Result<Vec<Self>, IndexWatchError> {
        Self::query_with_paths(
            conn,
            "SELECT id, project_id, name, cron_expression, enabled, last_run, created
             FROM schedules
             WHERE enabled = 1
             ORDER BY created, id",
            rusqlite::params![],
        )
    }

    pub fn list_for_project(
        conn: &Connection,
        project_id: &str,
    ) -> Result<Vec<Self>, IndexWatchError> {
        Self::query_with_paths(
            conn,
            "SELECT id, project_id, name, cron_expression, enabled, last_run, created
             FROM schedules
             WHERE project_id = ?
             ORDER BY created, id",
            [project_id],
        )
    }

    /// Paths in insertion order
    pub fn paths_for(conn: &Connection, schedule_id: &str) -> Result<Vec<String>, IndexWatchError> {
        let mut stmt =
            conn.prepare("SELECT path FROM schedule_paths WHERE schedule_id = ? ORDER BY rowid")?;
        let paths = stmt
            .query_map([schedule_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    /// Delete a schedule; its path rows go with it via the cascading foreign key.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn delete(conn: &Connection, id: &str) -> Result<(), IndexWatchError> {
        let rows_affected = conn.execute("DELETE FROM schedules WHERE id = ?", [id])?;
        if rows_affected == 0 {
            return Err(IndexWatchError::ScheduleNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn set_enabled(conn: &Connection, id: &str, enabled: bool) -> Result<(), IndexWatchError> {
        let rows_affected = conn.execute(
            "UPDATE schedules SET enabled = ? WHERE id = ?",
            rusqlite::params![enabled, id],
        )?;
        if rows_affected == 0 {
            return Err(IndexWatchError::ScheduleNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a successful run. Returns false when the schedule no longer exists.
    /// last_run never moves backwards.
    pub fn set_last_run(conn: &Connection, id: &str, timestamp: i64) -> Result<bool, IndexWatchError> {
        let rows_affected = conn.execute(
            "UPDATE schedules SET last_run = MAX(COALESCE(last_run, ?1), ?1) WHERE id = ?2",
            rusqlite::params![timestamp, id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Record a successful run of `path` for every schedule of `project_id` that owns it.
    /// Returns the number of schedules updated.
    pub fn set_last_run_for_path(
        conn: &Connection,
        project_id: &str,
        path: &str,
        timestamp: i64,
    ) -> Result<usize, IndexWatchError> {
        let rows_affected = conn.execute(
            "UPDATE schedules SET last_run = MAX(COALESCE(last_run, ?1), ?1)
             WHERE project_id = ?2
               AND id IN (SELECT schedule_id FROM schedule_paths WHERE path = ?3)",
            rusqlite::params![timestamp, project_id, path],
        )?;
        Ok(rows_affected)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Schedule {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            paths: Vec::new(),
            cron_expression: row.get(3)?,
            enabled: row.get(4)?,
            last_run: row.get(5)?,
            created: row.get(6)?,
        })
    }

    fn query_with_paths<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<Self>, IndexWatchError> {
        let mut stmt = conn.prepare(sql)?;
        let mut schedules = stmt
            .query_map(params, Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        for schedule in &mut schedules {
            schedule.paths = Self::paths_for(conn, &schedule.id)?;
        }

        Ok(schedules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::projects::Project;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn open_db_with_projects() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_dir(dir.path(), 2).unwrap();
        db.immediate_transaction(|c| {
            Project::create(c, "p1", "Research", None, &[])?;
            Project::create(c, "p2", "Personal", None, &[])
        })
        .unwrap();
        (dir, db)
    }

    fn spec(id: &str, project_id: &str, paths: &[&str]) -> ScheduleSpec {
        ScheduleSpec {
            id: Some(id.to_string()),
            project_id: project_id.to_string(),
            name: format!("Schedule {}", id),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            cron_expression: "0 0 * * *".to_string(),
        }
    }

    fn insert(db: &Database, schedule: &Schedule) {
        db.immediate_transaction(|c| schedule.insert(c)).unwrap();
    }

    #[test]
    fn test_from_spec_normalizes_paths() {
        let schedule = Schedule::from_spec(ScheduleSpec {
            id: None,
            project_id: " p1 ".to_string(),
            name: " Nightly ".to_string(),
            paths: vec![" /docs ".into(), "/notes".into(), "/docs".into()],
            cron_expression: " 0 0 * * * ".to_string(),
        });

        assert!(!schedule.id.is_empty());
        assert_eq!(schedule.project_id, "p1");
        assert_eq!(schedule.name, "Nightly");
        assert_eq!(schedule.paths, vec!["/docs".to_string(), "/notes".to_string()]);
        assert_eq!(schedule.cron_expression, "0 0 * * *");
        assert!(schedule.enabled);
        assert_eq!(schedule.last_run, None);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = Schedule::from_spec(ScheduleSpec::default());
        let b = Schedule::from_spec(ScheduleSpec::default());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_validate() {
        let valid = Schedule::from_spec(spec("s1", "p1", &["/docs"]));
        assert!(valid.validate().is_ok());

        let no_paths = Schedule::from_spec(spec("s1", "p1", &[]));
        assert!(matches!(no_paths.validate(), Err(IndexWatchError::InvalidSchedule(_))));

        let blank_path = Schedule::from_spec(spec("s1", "p1", &["  "]));
        assert!(matches!(blank_path.validate(), Err(IndexWatchError::InvalidSchedule(_))));

        let mut no_name = Schedule::from_spec(spec("s1", "p1", &["/docs"]));
        no_name.name.clear();
        assert!(matches!(no_name.validate(), Err(IndexWatchError::InvalidSchedule(_))));

        let mut bad_cron = Schedule::from_spec(spec("s1", "p1", &["/docs"]));
        bad_cron.cron_expression = "every day".to_string();
        assert!(matches!(bad_cron.validate(), Err(IndexWatchError::InvalidCron { .. })));
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, db) = open_db_with_projects();
        let schedule = Schedule::from_spec(spec("s1", "p1", &["/docs", "/notes"]));
        insert(&db, &schedule);

        let conn = db.get_connection().unwrap();
        let loaded = Schedule::get_by_id(&conn, "s1").unwrap().unwrap();
        assert_eq!(loaded, schedule);
        assert!(Schedule::get_by_id(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_requires_existing_project() {
        let (_dir, db) = open_db_with_projects();
        let schedule = Schedule::from_spec(spec("s1", "no-such-project", &["/docs"]));
        let result = db.immediate_transaction(|c| schedule.insert(c));
        assert!(matches!(result, Err(IndexWatchError::DatabaseError(_))));

        // Nothing from the failed insert is left behind
        let conn = db.get_connection().unwrap();
        assert!(Schedule::list(&conn).unwrap().is_empty());
        assert!(Schedule::paths_for(&conn, "s1").unwrap().is_empty());
    }

    #[test]
    fn test_list_enabled_and_for_project() {
        let (_dir, db) = open_db_with_projects();
        insert(&db, &Schedule::from_spec(spec("s1", "p1", &["/docs"])));
        insert(&db, &Schedule::from_spec(spec("s2", "p1", &["/notes"])));
        insert(&db, &Schedule::from_spec(spec("s3", "p2", &["/photos"])));

        let conn = db.get_connection().unwrap();
        Schedule::set_enabled(&conn, "s2", false).unwrap();

        let enabled: Vec<String> = Schedule::list_enabled(&conn)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(enabled.len(), 2);
        assert!(enabled.contains(&"s1".to_string()));
        assert!(enabled.contains(&"s3".to_string()));

        let for_p1 = Schedule::list_for_project(&conn, "p1").unwrap();
        assert_eq!(for_p1.len(), 2);
        assert_eq!(Schedule::list(&conn).unwrap().len(), 3);
    }

    #[test]
    fn test_delete_cascades_paths() {
        let (_dir, db) = open_db_with_projects();
        insert(&db, &Schedule::from_spec(spec("s1", "p1", &["/docs", "/notes"])));

        db.immediate_transaction(|c| Schedule::delete(c, "s1")).unwrap();

        let conn = db.get_connection().unwrap();
        let path_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schedule_paths", [], |row| row.get(0))
            .unwrap();
        assert_eq!(path_rows, 0);

        let again = db.immediate_transaction(|c| Schedule::delete(c, "s1"));
        assert!(matches!(again, Err(IndexWatchError::ScheduleNotFound(_))));
    }

    #[test]
    fn test_project_delete_cascades_schedules() {
        let (_dir, db) = open_db_with_projects();
        insert(&db, &Schedule::from_spec(spec("s1", "p1", &["/docs"])));
        insert(&db, &Schedule::from_spec(spec("s2", "p2", &["/docs"])));

        db.immediate_transaction(|c| Project::delete(c, "p1")).unwrap();

        let conn = db.get_connection().unwrap();
        let remaining: Vec<String> = Schedule::list(&conn)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(remaining, vec!["s2".to_string()]);
        assert!(Schedule::paths_for(&conn, "s1").unwrap().is_empty());
    }

    #[test]
    fn test_set_last_run_never_moves_backwards() {
        let (_dir, db) = open_db_with_projects();
        insert(&db, &Schedule::from_spec(spec("s1", "p1", &["/docs"])));
        let conn = db.get_connection().unwrap();

        assert!(Schedule::set_last_run(&conn, "s1", 2_000).unwrap());
        assert!(Schedule::set_last_run(&conn, "s1", 1_000).unwrap());
        let loaded = Schedule::get_by_id(&conn, "s1").unwrap().unwrap();
        assert_eq!(loaded.last_run, Some(2_000));

        // A deleted schedule is a no-op, not an error
        assert!(!Schedule::set_last_run(&conn, "gone", 3_000).unwrap());
    }

    #[test]
    fn test_set_last_run_for_path_scopes_by_project_and_path() {
        let (_dir, db) = open_db_with_projects();
        insert(&db, &Schedule::from_spec(spec("s1", "p1", &["/shared", "/docs"])));
        insert(&db, &Schedule::from_spec(spec("s2", "p1", &["/shared"])));
        insert(&db, &Schedule::from_spec(spec("s3", "p1", &["/other"])));
        insert(&db, &Schedule::from_spec(spec("s4", "p2", &["/shared"])));

        let conn = db.get_connection().unwrap();
        let updated = Schedule::set_last_run_for_path(&conn, "p1", "/shared", 1_234).unwrap();
        assert_eq!(updated, 2);

        let last_run = |id: &str| Schedule::get_by_id(&conn, id).unwrap().unwrap().last_run;
        assert_eq!(last_run("s1"), Some(1_234));
        assert_eq!(last_run("s2"), Some(1_234));
        assert_eq!(last_run("s3"), None);
        assert_eq!(last_run("s4"), None);
    }

    #[test]
    fn test_orphaned_schedule_loads_without_paths() {
        let (_dir, db) = open_db_with_projects();
        let conn = db.get_connection().unwrap();
        conn.execute(
            "INSERT INTO schedules (id, project_id, name, cron_expression) VALUES ('orphan', 'p1', 'Orphan', '0 0 * * *')",
            [],
        )
        .unwrap();

        let enabled = Schedule::list_enabled(&conn).unwrap();
        assert_eq!(enabled.len(), 1);
        assert!(enabled[0].paths.is_empty());
        assert_eq!(enabled[0].last_run, None);
    }
}
