//! Task repository.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Row};
use taskbridge_core::model::{Priority, SheetTableRef, Task, TaskSource, TaskStatus};

use super::{decode_ts, encode_ts, StoreError};

const COLUMNS: &str = "task_id, title, body, status, priority, source, assignee_member_id, \
                       labels, target_app_token, target_table_id, created_at, updated_at";

/// Filter for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assignee_member_id: Option<String>,
    pub source: Option<TaskSource>,
}

pub fn insert(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tasks (task_id, title, body, status, priority, source, assignee_member_id, \
         labels, target_app_token, target_table_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            task.task_id,
            task.title,
            task.body,
            task.status.as_str(),
            task.priority.as_str(),
            task.source.as_str(),
            task.assignee_member_id,
            serde_json::to_string(&task.labels)?,
            task.target_table.as_ref().map(|table| table.app_token.as_str()),
            task.target_table.as_ref().map(|table| table.table_id.as_str()),
            encode_ts(task.created_at),
            encode_ts(task.updated_at),
        ],
    )?;
    Ok(())
}

/// Writes the full row back. The caller owns bumping `updated_at` and
/// snapshotting the prior state into the sync log.
pub fn update(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE tasks SET title = ?2, body = ?3, status = ?4, priority = ?5, source = ?6, \
         assignee_member_id = ?7, labels = ?8, target_app_token = ?9, target_table_id = ?10, \
         updated_at = ?11
         WHERE task_id = ?1",
        params![
            task.task_id,
            task.title,
            task.body,
            task.status.as_str(),
            task.priority.as_str(),
            task.source.as_str(),
            task.assignee_member_id,
            serde_json::to_string(&task.labels)?,
            task.target_table.as_ref().map(|table| table.app_token.as_str()),
            task.target_table.as_ref().map(|table| table.table_id.as_str()),
            encode_ts(task.updated_at),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound {
            what: "task",
            id: task.task_id.clone(),
        });
    }
    Ok(())
}

pub fn get(conn: &Connection, task_id: &str) -> Result<Option<Task>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM tasks WHERE task_id = ?1"),
            params![task_id],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

/// Like [`get`], but a missing row is an error.
pub fn require(conn: &Connection, task_id: &str) -> Result<Task, StoreError> {
    get(conn, task_id)?.ok_or_else(|| StoreError::NotFound {
        what: "task",
        id: task_id.to_owned(),
    })
}

pub fn list(conn: &Connection, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM tasks ORDER BY created_at"))?;
    let raws = stmt
        .query_map([], raw_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut matched = Vec::new();
    for raw in raws {
        let task = from_raw(raw)?;
        if filter.status.is_some_and(|status| task.status != status) {
            continue;
        }
        if filter.source.is_some_and(|source| task.source != source) {
            continue;
        }
        if let Some(assignee) = &filter.assignee_member_id {
            if task.assignee_member_id.as_deref() != Some(assignee.as_str()) {
                continue;
            }
        }
        matched.push(task);
    }
    Ok(matched)
}

struct RawTask {
    task_id: String,
    title: String,
    body: String,
    status: String,
    priority: String,
    source: String,
    assignee_member_id: Option<String>,
    labels: String,
    target_app_token: Option<String>,
    target_table_id: Option<String>,
    created_at: String,
    updated_at: String,
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        task_id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        source: row.get(5)?,
        assignee_member_id: row.get(6)?,
        labels: row.get(7)?,
        target_app_token: row.get(8)?,
        target_table_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn from_raw(raw: RawTask) -> Result<Task, StoreError> {
    let status = TaskStatus::parse(&raw.status)
        .ok_or_else(|| StoreError::Constraint(format!("unknown task status {:?}", raw.status)))?;
    let priority = Priority::parse(&raw.priority)
        .ok_or_else(|| StoreError::Constraint(format!("unknown priority {:?}", raw.priority)))?;
    let source = TaskSource::parse(&raw.source)
        .ok_or_else(|| StoreError::Constraint(format!("unknown task source {:?}", raw.source)))?;
    let labels: BTreeSet<String> = serde_json::from_str(&raw.labels)?;
    let target_table = match (raw.target_app_token, raw.target_table_id) {
        (Some(app_token), Some(table_id)) => Some(SheetTableRef::new(app_token, table_id)),
        _ => None,
    };
    Ok(Task {
        task_id: raw.task_id,
        title: raw.title,
        body: raw.body,
        status,
        priority,
        source,
        assignee_member_id: raw.assignee_member_id,
        labels,
        target_table,
        created_at: decode_ts(&raw.created_at)?,
        updated_at: decode_ts(&raw.updated_at)?,
    })
}
