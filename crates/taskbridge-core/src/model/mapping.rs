//! Mapping between a local task and its external bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::registry::SheetTableRef;

/// Reference to a forge issue: repository slug plus issue number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForgeIssueRef {
    /// `owner/repo` slug.
    pub repo: String,
    pub number: u64,
}

impl ForgeIssueRef {
    #[must_use]
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }
}

/// Reference to a sheet record inside a registered table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetRecordRef {
    pub app_token: String,
    pub table_id: String,
    pub record_id: String,
}

impl SheetRecordRef {
    #[must_use]
    pub fn new(
        app_token: impl Into<String>,
        table_id: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            app_token: app_token.into(),
            table_id: table_id.into(),
            record_id: record_id.into(),
        }
    }

    /// The table this record lives in.
    #[must_use]
    pub fn table(&self) -> SheetTableRef {
        SheetTableRef::new(self.app_token.clone(), self.table_id.clone())
    }
}

/// Synchronization health of one task's external bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
    Error,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "synced" => Some(Self::Synced),
            "pending" => Some(Self::Pending),
            "conflict" => Some(Self::Conflict),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Durable association between one task and up to one binding per store.
///
/// A binding, once set, is immutable for the task's lifetime: the external
/// id is how the row is found again. Bindings accrete; a task created from
/// the forge may later gain a sheet binding through conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub mapping_id: String,
    pub task_id: String,
    pub forge: Option<ForgeIssueRef>,
    pub sheet: Option<SheetRecordRef>,
    pub sync_status: SyncStatus,
    /// Watermark of the last reconciled state, used to detect that both
    /// sides changed since the last sync.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Content hash of the last pulled sheet state, for tables without a
    /// last-modified column.
    pub sheet_content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mapping {
    /// A fresh, unbound mapping for a task.
    #[must_use]
    pub fn new(task_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            mapping_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            forge: None,
            sheet: None,
            sync_status: SyncStatus::Pending,
            last_synced_at: None,
            sheet_content_hash: None,
            created_at: now,
            updated_at: now,
        }
    }
}
