//! Pure translation between the internal task shape and both external
//! record shapes.
//!
//! Everything here is deterministic over its inputs. Identity resolution,
//! clock reads, and store access stay with the callers; the mapper only
//! reshapes data.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::forge::{ForgeIssue, IssuePatch, NewIssue};
use crate::model::{Priority, TableRegistryEntry, Task, TaskSource, TaskStatus};
use crate::sheet::{JsonMap, SheetRecord};

/// Placeholder stored locally when a pulled title is empty. Never written
/// back to either external store.
pub const UNTITLED: &str = "(untitled)";

const AUTO_TAG: &str = "[AUTO][task:";

/// Title written to created forge issues: `[AUTO][task:<id>] <title>`.
///
/// The prefix doubles as the deterministic key for idempotent creation:
/// a retried create first searches for it.
#[must_use]
pub fn prefixed_title(task_id: &str, title: &str) -> String {
    format!("{AUTO_TAG}{task_id}] {title}")
}

/// The prefix alone, for lookups.
#[must_use]
pub fn title_prefix(task_id: &str) -> String {
    format!("{AUTO_TAG}{task_id}]")
}

/// Strips the automation prefix from a pulled forge title, returning the
/// bare title. Titles without the prefix pass through unchanged.
#[must_use]
pub fn strip_title_prefix(title: &str) -> &str {
    if let Some(rest) = title.strip_prefix(AUTO_TAG) {
        if let Some(end) = rest.find(']') {
            return rest[end + 1..].trim_start();
        }
    }
    title
}

/// The set of task fields an update touched. Determines which external
/// mutations an intent enqueues and what a forge patch carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelection {
    pub title: bool,
    pub body: bool,
    pub status: bool,
    pub assignee: bool,
    pub labels: bool,
    pub priority: bool,
}

impl FieldSelection {
    #[must_use]
    pub const fn all() -> Self {
        Self {
            title: true,
            body: true,
            status: true,
            assignee: true,
            labels: true,
            priority: true,
        }
    }

    #[must_use]
    pub const fn status_only() -> Self {
        Self {
            title: false,
            body: false,
            status: true,
            assignee: false,
            labels: false,
            priority: false,
        }
    }

    #[must_use]
    pub const fn any(self) -> bool {
        self.title || self.body || self.status || self.assignee || self.labels || self.priority
    }

    /// Fields on which `before` and `after` differ.
    #[must_use]
    pub fn diff(before: &Task, after: &Task) -> Self {
        Self {
            title: before.title != after.title,
            body: before.body != after.body,
            status: before.status != after.status,
            assignee: before.assignee_member_id != after.assignee_member_id,
            labels: before.labels != after.labels,
            priority: before.priority != after.priority,
        }
    }
}

/// Full label set written to the forge: task labels plus the encoded
/// priority.
#[must_use]
pub fn forge_labels(task: &Task) -> Vec<String> {
    let mut labels: Vec<String> = task.labels.iter().cloned().collect();
    labels.push(task.priority.label());
    labels
}

/// Builds the creation payload for a task's forge issue.
#[must_use]
pub fn task_to_forge_issue(task: &Task, assignee_username: Option<&str>) -> NewIssue {
    let body = if task.body.is_empty() {
        format!("Task ID: {}", task.task_id)
    } else {
        task.body.clone()
    };
    NewIssue {
        title: prefixed_title(&task.task_id, &task.title),
        body,
        labels: forge_labels(task),
        assignees: assignee_username.map(|name| vec![name.to_owned()]).unwrap_or_default(),
    }
}

/// Builds a forge patch carrying exactly the selected fields.
///
/// An absent assignee clears the issue's assignee list.
#[must_use]
pub fn task_to_forge_patch(
    task: &Task,
    fields: FieldSelection,
    assignee_username: Option<&str>,
) -> IssuePatch {
    let mut patch = IssuePatch::default();
    if fields.title {
        patch.title = Some(prefixed_title(&task.task_id, &task.title));
    }
    if fields.body {
        patch.body = Some(task.body.clone());
    }
    if fields.status {
        let (state, reason) = task.status.to_forge();
        patch.state = Some(state);
        patch.state_reason = reason;
    }
    if fields.labels || fields.priority {
        patch.labels = Some(forge_labels(task));
    }
    if fields.assignee {
        patch.assignees = Some(
            assignee_username
                .map(|name| vec![name.to_owned()])
                .unwrap_or_default(),
        );
    }
    patch
}

/// Folds a forge issue into the local task shape.
///
/// With an existing task the identity, source, assignee, and target table
/// carry over; without one a fresh `forge_pull` task is minted. The issue's
/// `updated_at` becomes the task's, so last-write-wins comparisons see the
/// remote edit time.
#[must_use]
pub fn forge_issue_to_task(issue: &ForgeIssue, existing: Option<&Task>) -> Task {
    let stripped = strip_title_prefix(&issue.title);
    let title = if stripped.trim().is_empty() {
        UNTITLED.to_owned()
    } else {
        stripped.to_owned()
    };

    let mut labels = BTreeSet::new();
    let mut priority = existing.map_or_else(Priority::default, |task| task.priority);
    for label in &issue.labels {
        match Priority::from_label(label) {
            Some(parsed) => priority = parsed,
            None => {
                labels.insert(label.clone());
            }
        }
    }

    // The create payload substitutes a `Task ID:` body for empty ones;
    // fold that back to empty so push-then-pull converges.
    let body = if existing
        .is_some_and(|task| issue.body == format!("Task ID: {}", task.task_id))
    {
        String::new()
    } else {
        issue.body.clone()
    };

    Task {
        task_id: existing.map_or_else(|| Uuid::new_v4().to_string(), |task| task.task_id.clone()),
        title,
        body,
        status: TaskStatus::from_forge(
            issue.state,
            issue.state_reason,
            existing.map(|task| task.status),
        ),
        priority,
        source: existing.map_or(TaskSource::ForgePull, |task| task.source),
        assignee_member_id: existing.and_then(|task| task.assignee_member_id.clone()),
        labels,
        target_table: existing.and_then(|task| task.target_table.clone()),
        created_at: existing.map_or(issue.created_at, |task| task.created_at),
        updated_at: issue.updated_at,
    }
}

/// Resolver-provided context for a sheet write.
#[derive(Debug, Clone, Copy, Default)]
pub struct SheetWriteContext<'a> {
    pub assignee_open_id: Option<&'a str>,
    /// Bound forge issue number, written to the issue-link column.
    pub issue_number: Option<u64>,
}

/// Builds the field map written to a task's sheet record.
///
/// A task with no assignee writes an empty person list, clearing the
/// column. The last-sync column records `synced_at` as epoch millis.
#[must_use]
pub fn task_to_sheet_fields(
    task: &Task,
    entry: &TableRegistryEntry,
    ctx: SheetWriteContext<'_>,
    synced_at: DateTime<Utc>,
) -> JsonMap {
    let map = &entry.fields;
    let mut fields = JsonMap::new();
    fields.insert(map.title.clone(), json!(task.title));
    fields.insert(map.status.clone(), json!(task.status.sheet_label()));
    fields.insert(
        map.assignee.clone(),
        ctx.assignee_open_id
            .map_or_else(|| json!([]), |id| json!([{ "id": id }])),
    );
    if let Some(number) = ctx.issue_number {
        fields.insert(map.github_issue.clone(), json!(number));
    }
    if let Some(priority_field) = &map.priority {
        fields.insert(priority_field.clone(), json!(task.priority.sheet_label()));
    }
    if let Some(description_field) = &map.description {
        fields.insert(description_field.clone(), json!(task.body));
    }
    fields.insert(map.last_sync.clone(), json!(synced_at.timestamp_millis()));
    fields
}

/// Result of folding a sheet record into the local task shape.
#[derive(Debug, Clone)]
pub struct SheetPull {
    pub task: Task,
    /// Raw status value when it fell outside the lattice; the local status
    /// is left untouched in that case.
    pub foreign_status: Option<String>,
    /// Open id from the assignee column, for the caller to resolve.
    pub assignee_open_id: Option<String>,
    /// Issue number from the issue-link column, if the table carries one.
    pub issue_number: Option<u64>,
}

/// Folds a sheet record into the local task shape.
///
/// `observed_at` stamps `updated_at` when the record carries no
/// last-modified time of its own.
#[must_use]
pub fn sheet_record_to_task(
    record: &SheetRecord,
    entry: &TableRegistryEntry,
    existing: Option<&Task>,
    observed_at: DateTime<Utc>,
) -> SheetPull {
    let map = &entry.fields;

    let raw_title = record.fields.get(&map.title).map(text_value).unwrap_or_default();
    let title = if raw_title.trim().is_empty() {
        UNTITLED.to_owned()
    } else {
        raw_title
    };

    let fallback_status = existing.map_or(TaskStatus::ToDo, |task| task.status);
    let (status, foreign_status) = match record.fields.get(&map.status) {
        None => (fallback_status, None),
        Some(value) => {
            let raw = text_value(value);
            if raw.trim().is_empty() {
                (fallback_status, None)
            } else {
                match TaskStatus::from_sheet_label(&raw) {
                    Some(parsed) => (parsed, None),
                    None => (fallback_status, Some(raw)),
                }
            }
        }
    };

    let priority = map
        .priority
        .as_ref()
        .and_then(|field| record.fields.get(field))
        .map(text_value)
        .and_then(|raw| Priority::parse(&raw))
        .unwrap_or_else(|| existing.map_or_else(Priority::default, |task| task.priority));

    let body = map
        .description
        .as_ref()
        .and_then(|field| record.fields.get(field))
        .map(text_value)
        .unwrap_or_else(|| existing.map_or_else(String::new, |task| task.body.clone()));

    let assignee_open_id = record
        .fields
        .get(&map.assignee)
        .and_then(Value::as_array)
        .and_then(|people| people.first())
        .and_then(|person| person.get("id"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    let issue_number = record
        .fields
        .get(&map.github_issue)
        .and_then(|value| match value {
            Value::Number(n) => n.as_u64(),
            other => text_value(other).parse().ok(),
        });

    let task = Task {
        task_id: existing.map_or_else(|| Uuid::new_v4().to_string(), |task| task.task_id.clone()),
        title,
        body,
        status,
        priority,
        source: existing.map_or(TaskSource::SheetPull, |task| task.source),
        assignee_member_id: existing.and_then(|task| task.assignee_member_id.clone()),
        labels: existing.map_or_else(BTreeSet::new, |task| task.labels.clone()),
        target_table: existing
            .and_then(|task| task.target_table.clone())
            .or_else(|| Some(entry.table.clone())),
        created_at: existing.map_or(observed_at, |task| task.created_at),
        updated_at: record.last_modified.unwrap_or(observed_at),
    };

    SheetPull {
        task,
        foreign_status,
        assignee_open_id,
        issue_number,
    }
}

/// Extracts plain text from the shapes sheet cells come in: a string, a
/// rich-text segment list, a single-select option object, or a number.
#[must_use]
pub fn text_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.get("text")
                    .and_then(Value::as_str)
                    .map_or_else(|| text_value(item), ToOwned::to_owned)
            })
            .collect::<Vec<_>>()
            .join(""),
        Value::Object(object) => object
            .get("name")
            .or_else(|| object.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        Value::Bool(_) | Value::Null => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::{IssueState, SheetTableRef, StateReason};

    fn sample_task() -> Task {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut task = Task::new("Ship the importer", TaskSource::Intent, now);
        task.body = "Move the importer behind the new flag".to_owned();
        task.status = TaskStatus::InProgress;
        task.priority = Priority::High;
        task.labels = ["bug".to_owned(), "importer".to_owned()].into();
        task
    }

    fn entry() -> TableRegistryEntry {
        TableRegistryEntry::new(SheetTableRef::new("bas123", "tbl456"), "Tasks")
    }

    #[test]
    fn title_prefix_round_trips() {
        let full = prefixed_title("abc-123", "Fix the build");
        assert_eq!(full, "[AUTO][task:abc-123] Fix the build");
        assert_eq!(strip_title_prefix(&full), "Fix the build");
        assert_eq!(strip_title_prefix("plain title"), "plain title");
    }

    #[test]
    fn forge_round_trip_preserves_content() {
        let task = sample_task();
        let payload = task_to_forge_issue(&task, Some("devuser"));
        assert!(payload.labels.contains(&"priority:high".to_owned()));

        let issue = ForgeIssue {
            number: 7,
            title: payload.title,
            body: payload.body,
            state: IssueState::Open,
            state_reason: None,
            labels: payload.labels,
            assignees: payload.assignees,
            created_at: task.created_at,
            updated_at: task.updated_at,
        };
        let back = forge_issue_to_task(&issue, Some(&task));
        assert!(back.same_content(&task), "{back:?} vs {task:?}");
    }

    #[test]
    fn forge_pull_substitutes_untitled() {
        let issue = ForgeIssue {
            number: 9,
            title: "[AUTO][task:xyz] ".to_owned(),
            body: String::new(),
            state: IssueState::Open,
            state_reason: None,
            labels: vec![],
            assignees: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let task = forge_issue_to_task(&issue, None);
        assert_eq!(task.title, UNTITLED);
        assert_eq!(task.source, TaskSource::ForgePull);
    }

    #[test]
    fn cancelled_issue_reads_as_cancelled() {
        let issue = ForgeIssue {
            number: 3,
            title: "t".to_owned(),
            body: String::new(),
            state: IssueState::Closed,
            state_reason: Some(StateReason::NotPlanned),
            labels: vec![],
            assignees: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(forge_issue_to_task(&issue, None).status, TaskStatus::Cancelled);
    }

    #[test]
    fn sheet_round_trip_preserves_content() {
        let task = sample_task();
        let synced_at = task.updated_at;
        let fields = task_to_sheet_fields(
            &task,
            &entry(),
            SheetWriteContext {
                assignee_open_id: Some("ou_abc"),
                issue_number: Some(12),
            },
            synced_at,
        );
        assert_eq!(fields.get("Status"), Some(&json!("In Progress")));
        assert_eq!(fields.get("GitHub Issue"), Some(&json!(12)));

        let record = SheetRecord {
            record_id: "rec1".to_owned(),
            fields,
            last_modified: Some(task.updated_at),
        };
        let pull = sheet_record_to_task(&record, &entry(), Some(&task), synced_at);
        assert!(pull.task.same_content(&task));
        assert_eq!(pull.assignee_open_id.as_deref(), Some("ou_abc"));
        assert_eq!(pull.issue_number, Some(12));
        assert!(pull.foreign_status.is_none());
    }

    #[test]
    fn unknown_sheet_status_is_reported_not_applied() {
        let task = sample_task();
        let mut fields = JsonMap::new();
        fields.insert("Task Name".into(), json!("Ship the importer"));
        fields.insert("Status".into(), json!({ "name": "Blocked" }));
        let record = SheetRecord {
            record_id: "rec2".to_owned(),
            fields,
            last_modified: None,
        };
        let pull = sheet_record_to_task(&record, &entry(), Some(&task), Utc::now());
        assert_eq!(pull.foreign_status.as_deref(), Some("Blocked"));
        assert_eq!(pull.task.status, TaskStatus::InProgress);
    }

    #[test]
    fn patch_carries_only_selected_fields() {
        let task = sample_task();
        let patch = task_to_forge_patch(&task, FieldSelection::status_only(), None);
        assert_eq!(patch.state, Some(IssueState::Open));
        assert!(patch.title.is_none());
        assert!(patch.labels.is_none());

        let mut closed = task;
        closed.status = TaskStatus::Done;
        let patch = task_to_forge_patch(&closed, FieldSelection::status_only(), None);
        assert_eq!(patch.state, Some(IssueState::Closed));
        assert_eq!(patch.state_reason, Some(StateReason::Completed));
    }

    #[test]
    fn diff_tracks_changed_fields() {
        let before = sample_task();
        let mut after = before.clone();
        after.title = "Ship the importer v2".to_owned();
        after.status = TaskStatus::Done;
        let diff = FieldSelection::diff(&before, &after);
        assert!(diff.title && diff.status);
        assert!(!diff.body && !diff.labels && !diff.assignee && !diff.priority);
    }
}
