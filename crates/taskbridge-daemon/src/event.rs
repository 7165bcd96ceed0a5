//! Durable outbox event vocabulary.
//!
//! Every external side effect is modelled as one variant here; the
//! dispatcher is a total function over the enum, so adding a kind is a
//! localized change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskbridge_core::mapper::FieldSelection;
use taskbridge_core::model::{CloseReason, ForgeIssueRef, SheetRecordRef, SheetTableRef};

/// The side effect an outbox row asks the dispatcher to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Create the task's forge issue and bind the mapping.
    ForgeCreateIssue { task_id: String },
    /// Patch the bound forge issue with the selected fields.
    ForgeUpdateIssue {
        task_id: String,
        fields: FieldSelection,
    },
    /// Close the bound forge issue with the mapped reason.
    ForgeCloseIssue {
        task_id: String,
        reason: CloseReason,
    },
    /// Create the task's sheet record in the given table and bind the
    /// mapping.
    SheetCreateRecord {
        task_id: String,
        table: SheetTableRef,
    },
    /// Rewrite the bound sheet record.
    SheetUpdateRecord {
        task_id: String,
        fields: FieldSelection,
    },
    /// Import a forge issue as a local task and push it to a sheet table.
    ConvertForgeToSheet {
        issue: ForgeIssueRef,
        table: SheetTableRef,
    },
    /// Import a sheet record as a local task and push it to the forge.
    ConvertSheetToForge { record: SheetRecordRef },
    /// Deliver an operator-visible message. `None` addresses the operator
    /// chat.
    NotifyMember {
        member_id: Option<String>,
        message: String,
    },
}

impl EventPayload {
    /// Stable kind tag, matching the serialized `kind` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ForgeCreateIssue { .. } => "forge_create_issue",
            Self::ForgeUpdateIssue { .. } => "forge_update_issue",
            Self::ForgeCloseIssue { .. } => "forge_close_issue",
            Self::SheetCreateRecord { .. } => "sheet_create_record",
            Self::SheetUpdateRecord { .. } => "sheet_update_record",
            Self::ConvertForgeToSheet { .. } => "convert_forge_to_sheet",
            Self::ConvertSheetToForge { .. } => "convert_sheet_to_forge",
            Self::NotifyMember { .. } => "notify_member",
        }
    }

    /// The task this event is serialized against, if any. Events sharing a
    /// task id are never in flight concurrently and are dispatched in
    /// enqueue order.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::ForgeCreateIssue { task_id }
            | Self::ForgeUpdateIssue { task_id, .. }
            | Self::ForgeCloseIssue { task_id, .. }
            | Self::SheetCreateRecord { task_id, .. }
            | Self::SheetUpdateRecord { task_id, .. } => Some(task_id),
            Self::ConvertForgeToSheet { .. }
            | Self::ConvertSheetToForge { .. }
            | Self::NotifyMember { .. } => None,
        }
    }
}

/// Lifecycle of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Sent,
    Dead,
}

impl EventStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Dead => "dead",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

/// A claimed or inspected outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub event_id: String,
    pub payload: EventPayload,
    pub status: EventStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_through_json() {
        let payload = EventPayload::ForgeUpdateIssue {
            task_id: "t-1".into(),
            fields: FieldSelection::status_only(),
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains(r#""kind":"forge_update_issue""#));
        let decoded: EventPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn kind_tag_matches_serialized_form() {
        let payload = EventPayload::NotifyMember {
            member_id: None,
            message: "hello".into(),
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded["kind"], payload.kind());
    }
}
