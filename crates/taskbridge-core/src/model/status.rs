//! Status lattice and closed vocabularies for tasks.
//!
//! The four internal statuses are the single source of truth. Every external
//! representation maps into and out of this set; a remote value outside the
//! lattice is never silently coerced, callers get `None` and decide.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Internal task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    ToDo,
    InProgress,
    Done,
    Cancelled,
}

impl TaskStatus {
    /// All lattice members, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::ToDo, Self::InProgress, Self::Done, Self::Cancelled];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToDo => "ToDo",
            Self::InProgress => "InProgress",
            Self::Done => "Done",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Parses a status from user or remote input, tolerating case and
    /// separator variations (`"to do"`, `"in_progress"`, `"Done"`).
    ///
    /// Returns `None` for values outside the lattice.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let folded: String = raw
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "todo" => Some(Self::ToDo),
            "inprogress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// The literal single-select option name used on the sheet side.
    #[must_use]
    pub const fn sheet_label(self) -> &'static str {
        match self {
            Self::ToDo => "To Do",
            Self::InProgress => "In Progress",
            Self::Done => "Done",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Maps a sheet status option back into the lattice.
    #[must_use]
    pub fn from_sheet_label(raw: &str) -> Option<Self> {
        Self::parse(raw)
    }

    /// Forge representation of this status on write.
    ///
    /// Both `ToDo` and `InProgress` write as an open issue; the distinction
    /// lives only in the local record and on the sheet side.
    #[must_use]
    pub const fn to_forge(self) -> (IssueState, Option<StateReason>) {
        match self {
            Self::ToDo | Self::InProgress => (IssueState::Open, None),
            Self::Done => (IssueState::Closed, Some(StateReason::Completed)),
            Self::Cancelled => (IssueState::Closed, Some(StateReason::NotPlanned)),
        }
    }

    /// Internal status for a forge issue state.
    ///
    /// An open issue keeps `InProgress` when the existing task was already in
    /// progress (the forge cannot express the difference); otherwise it reads
    /// as `ToDo`. A closed issue reads as `Cancelled` only for the
    /// `not_planned` reason.
    #[must_use]
    pub fn from_forge(
        state: IssueState,
        reason: Option<StateReason>,
        previous: Option<Self>,
    ) -> Self {
        match state {
            IssueState::Open => {
                if previous == Some(Self::InProgress) {
                    Self::InProgress
                } else {
                    Self::ToDo
                }
            }
            IssueState::Closed => match reason {
                Some(StateReason::NotPlanned) => Self::Cancelled,
                _ => Self::Done,
            },
        }
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forge issue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Forge close/reopen reason, as accepted by the issue patch endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateReason {
    Completed,
    NotPlanned,
    Reopened,
}

impl StateReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NotPlanned => "not_planned",
            Self::Reopened => "reopened",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(Self::Completed),
            "not_planned" => Some(Self::NotPlanned),
            "reopened" => Some(Self::Reopened),
            _ => None,
        }
    }
}

/// The reason a task is closed through the intent API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    NotPlanned,
}

impl CloseReason {
    /// The terminal status this close reason maps to.
    #[must_use]
    pub const fn target_status(self) -> TaskStatus {
        match self {
            Self::Completed => TaskStatus::Done,
            Self::NotPlanned => TaskStatus::Cancelled,
        }
    }

    #[must_use]
    pub const fn state_reason(self) -> StateReason {
        match self {
            Self::Completed => StateReason::Completed,
            Self::NotPlanned => StateReason::NotPlanned,
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" | "done" => Some(Self::Completed),
            "not_planned" | "cancelled" | "canceled" => Some(Self::NotPlanned),
            _ => None,
        }
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Forge label encoding (`priority:<level>`).
    #[must_use]
    pub fn label(self) -> String {
        format!("priority:{}", self.as_str())
    }

    /// Recovers a priority from a forge label, if it is a priority label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        label.strip_prefix("priority:").and_then(Self::parse)
    }

    /// The single-select option name used on the sheet side.
    #[must_use]
    pub const fn sheet_label(self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task record originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Intent,
    ForgePull,
    SheetPull,
}

impl TaskSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::ForgePull => "forge_pull",
            Self::SheetPull => "sheet_pull",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "intent" => Some(Self::Intent),
            "forge_pull" => Some(Self::ForgePull),
            "sheet_pull" => Some(Self::SheetPull),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forge_round_trip_closes_over_lattice() {
        for status in TaskStatus::ALL {
            let (state, reason) = status.to_forge();
            let back = TaskStatus::from_forge(state, reason, Some(status));
            assert_eq!(back, status, "round trip for {status}");
        }
    }

    #[test]
    fn sheet_round_trip_closes_over_lattice() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_sheet_label(status.sheet_label()), Some(status));
        }
    }

    #[test]
    fn open_issue_defaults_to_todo_without_context() {
        assert_eq!(
            TaskStatus::from_forge(IssueState::Open, None, None),
            TaskStatus::ToDo
        );
        assert_eq!(
            TaskStatus::from_forge(IssueState::Open, None, Some(TaskStatus::Done)),
            TaskStatus::ToDo
        );
    }

    #[test]
    fn parse_tolerates_separator_noise() {
        assert_eq!(TaskStatus::parse("In Progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse("to_do"), Some(TaskStatus::ToDo));
        assert_eq!(TaskStatus::parse("blocked"), None);
    }

    #[test]
    fn priority_label_round_trip() {
        for p in [Priority::Critical, Priority::High, Priority::Medium, Priority::Low] {
            assert_eq!(Priority::from_label(&p.label()), Some(p));
        }
        assert_eq!(Priority::from_label("bug"), None);
    }
}
