//! The local task record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::registry::SheetTableRef;
use super::status::{Priority, TaskSource, TaskStatus};

/// A locally owned work item.
///
/// The local row is authoritative between reconciler ticks; `updated_at`
/// drives last-write-wins conflict resolution against remote edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub body: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub source: TaskSource,
    pub assignee_member_id: Option<String>,
    pub labels: BTreeSet<String>,
    pub target_table: Option<SheetTableRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    #[must_use]
    pub fn new(title: impl Into<String>, source: TaskSource, now: DateTime<Utc>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            title: title.into(),
            body: String::new(),
            status: TaskStatus::ToDo,
            priority: Priority::default(),
            source,
            assignee_member_id: None,
            labels: BTreeSet::new(),
            target_table: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Compares the fields that participate in cross-store synchronization.
    ///
    /// Timestamps, source, and the target table are bookkeeping and do not
    /// make two task states semantically different.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.title == other.title
            && self.body == other.body
            && self.status == other.status
            && self.priority == other.priority
            && self.labels == other.labels
            && self.assignee_member_id == other.assignee_member_id
    }
}
