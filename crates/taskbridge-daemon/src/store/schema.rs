//! Schema DDL and forward-only migration.

use rusqlite::Connection;

use super::StoreError;

/// Current schema version, recorded in `user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS members (
    member_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    forge_username TEXT,
    sheet_open_id TEXT,
    role TEXT NOT NULL DEFAULT 'member',
    position TEXT,
    team TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    table_assignments TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'ToDo',
    priority TEXT NOT NULL DEFAULT 'medium',
    source TEXT NOT NULL DEFAULT 'intent',
    assignee_member_id TEXT REFERENCES members(member_id),
    labels TEXT NOT NULL DEFAULT '[]',
    target_app_token TEXT,
    target_table_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee_member_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS mappings (
    mapping_id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL UNIQUE REFERENCES tasks(task_id) ON DELETE CASCADE,
    forge_repo TEXT,
    forge_issue_number INTEGER,
    sheet_app_token TEXT,
    sheet_table_id TEXT,
    sheet_record_id TEXT,
    sync_status TEXT NOT NULL DEFAULT 'pending',
    last_synced_at TEXT,
    sheet_content_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_forge
    ON mappings(forge_repo, forge_issue_number)
    WHERE forge_issue_number IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_sheet
    ON mappings(sheet_record_id)
    WHERE sheet_record_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS sheet_tables (
    app_token TEXT NOT NULL,
    table_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    field_map TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (app_token, table_id)
);

CREATE TABLE IF NOT EXISTS outbox (
    event_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    task_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    last_error TEXT,
    not_before TEXT NOT NULL,
    processing_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outbox_claim ON outbox(status, not_before, created_at);
CREATE INDEX IF NOT EXISTS idx_outbox_task ON outbox(task_id) WHERE task_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS sync_log (
    id TEXT PRIMARY KEY,
    direction TEXT NOT NULL,
    subject TEXT NOT NULL,
    subject_id TEXT,
    status TEXT NOT NULL,
    message TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_log_subject ON sync_log(subject, subject_id);

CREATE TABLE IF NOT EXISTS sync_state (
    source TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Applies pending migrations. Migrations only ever move forward; opening a
/// database with a newer version than this build knows is an error.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if version < 1 {
        conn.execute_batch(SCHEMA_SQL)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}
