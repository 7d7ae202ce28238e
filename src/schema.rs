pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    created INTEGER NOT NULL DEFAULT (strftime('%s', 'now', 'utc')),
    updated INTEGER NOT NULL DEFAULT (strftime('%s', 'now', 'utc'))
);

CREATE TABLE IF NOT EXISTS project_paths (
    project_id TEXT NOT NULL,
    path TEXT NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    PRIMARY KEY (project_id, path)
);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    cron_expression TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run INTEGER,                   -- Unix timestamp (UTC), NULL until the first successful run
    created INTEGER NOT NULL DEFAULT (strftime('%s', 'now', 'utc')),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_schedules_enabled ON schedules (enabled);
CREATE INDEX IF NOT EXISTS idx_schedules_project ON schedules (project_id);

CREATE TABLE IF NOT EXISTS schedule_paths (
    schedule_id TEXT NOT NULL,
    path TEXT NOT NULL,
    FOREIGN KEY (schedule_id) REFERENCES schedules(id) ON DELETE CASCADE,
    PRIMARY KEY (schedule_id, path)
);

CREATE INDEX IF NOT EXISTS idx_schedule_paths_path ON schedule_paths (path);

-- Written by the indexing pipeline
CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    path TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    created INTEGER NOT NULL DEFAULT (strftime('%s', 'now', 'utc')),
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_embeddings_project ON embeddings (project_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_path ON embeddings (path);

COMMIT;
"#;
