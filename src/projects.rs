use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::IndexWatchError;

/// A named collection of filesystem paths to keep indexed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub paths: Vec<String>,
    pub created: i64, // Unix timestamp (UTC)
    pub updated: i64, // Unix timestamp (UTC)
}

impl Project {
    /// Insert a project and its paths.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn create(
        conn: &Connection,
        id: &str,
        name: &str,
        description: Option<&str>,
        paths: &[String],
    ) -> Result<Self, IndexWatchError> {
        if id.trim().is_empty() {
            return Err(IndexWatchError::Error("Project id cannot be empty".to_string()));
        }
        if name.trim().is_empty() {
            return Err(IndexWatchError::Error("Project name cannot be empty".to_string()));
        }

        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO projects (id, name, description, created, updated) VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![id, name, description, now, now],
        )?;

        let mut paths_out: Vec<String> = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.trim();
            if path.is_empty() || paths_out.iter().any(|p| p == path) {
                continue;
            }
            conn.execute(
                "INSERT INTO project_paths (project_id, path) VALUES (?, ?)",
                rusqlite::params![id, path],
            )?;
            paths_out.push(path.to_string());
        }

        Ok(Project {
            id: id.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            paths: paths_out,
            created: now,
            updated: now,
        })
    }

    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Self>, IndexWatchError> {
        let project = conn
            .query_row(
                "SELECT id, name, description, created, updated FROM projects WHERE id = ?",
                [id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        paths: Vec::new(),
                        created: row.get(3)?,
                        updated: row.get(4)?,
                    })
                },
            )
            .optional()?;

        match project {
            Some(mut project) => {
                project.paths = Self::paths_for(conn, &project.id)?;
                Ok(Some(project))
            }
            None => Ok(None),
        }
    }

    pub fn exists(conn: &Connection, id: &str) -> Result<bool, IndexWatchError> {
        let found = conn
            .query_row("SELECT 1 FROM projects WHERE id = ?", [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, IndexWatchError> {
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created, updated FROM projects ORDER BY name, id",
        )?;

        let mut projects = stmt
            .query_map([], |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    paths: Vec::new(),
                    created: row.get(3)?,
                    updated: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for project in &mut projects {
            project.paths = Self::paths_for(conn, &project.id)?;
        }

        Ok(projects)
    }

    /// Paths in insertion order
    pub fn paths_for(conn: &Connection, project_id: &str) -> Result<Vec<String>, IndexWatchError> {
        let mut stmt =
            conn.prepare("SELECT path FROM project_paths WHERE project_id = ? ORDER BY rowid")?;
        let paths = stmt
            .query_map([project_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    /// Delete a project. Schedules, schedule paths, project paths and embeddings
    /// are removed by the cascading foreign keys.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn delete(conn: &Connection, id: &str) -> Result<(), IndexWatchError> {
        let rows_affected = conn.execute("DELETE FROM projects WHERE id = ?", [id])?;
        if rows_affected == 0 {
            return Err(IndexWatchError::ProjectNotFound(id.to_string()));
        }
        Ok(())
    }
}
