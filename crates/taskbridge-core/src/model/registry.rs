//! Sheet table registry types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one table inside one sheet app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SheetTableRef {
    pub app_token: String,
    pub table_id: String,
}

impl SheetTableRef {
    #[must_use]
    pub fn new(app_token: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            app_token: app_token.into(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for SheetTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_token, self.table_id)
    }
}

/// Maps internal field names onto a table's column names.
///
/// `priority`, `description`, and `last_modified` are optional: a table
/// without those columns simply does not carry the value. `last_modified`
/// names an auto-updated date column the reconciler can filter on; without
/// it change detection falls back to a content scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    pub title: String,
    pub status: String,
    pub assignee: String,
    pub github_issue: String,
    pub last_sync: String,
    pub priority: Option<String>,
    pub description: Option<String>,
    pub last_modified: Option<String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            title: "Task Name".to_owned(),
            status: "Status".to_owned(),
            assignee: "Assignee".to_owned(),
            github_issue: "GitHub Issue".to_owned(),
            last_sync: "Last Sync".to_owned(),
            priority: Some("Priority".to_owned()),
            description: Some("Description".to_owned()),
            last_modified: None,
        }
    }
}

/// A registered sheet table with its column mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegistryEntry {
    pub table: SheetTableRef,
    pub display_name: String,
    pub fields: FieldMap,
    pub is_default: bool,
}

impl TableRegistryEntry {
    #[must_use]
    pub fn new(table: SheetTableRef, display_name: impl Into<String>) -> Self {
        Self {
            table,
            display_name: display_name.into(),
            fields: FieldMap::default(),
            is_default: false,
        }
    }
}
