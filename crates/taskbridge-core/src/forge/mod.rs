//! Typed facade over the forge issue tracker.

pub mod github;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::gateway::GatewayError;
use crate::model::{IssueState, StateReason};

/// An issue as read from the forge.
#[derive(Debug, Clone, PartialEq)]
pub struct ForgeIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: IssueState,
    pub state_reason: Option<StateReason>,
    pub labels: Vec<String>,
    /// Forge usernames of the assignees.
    pub assignees: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for issue creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
}

/// Partial update of an existing issue. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<IssueState>,
    pub state_reason: Option<StateReason>,
    pub labels: Option<Vec<String>>,
    pub assignees: Option<Vec<String>>,
}

impl IssuePatch {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.body.is_none()
            && self.state.is_none()
            && self.state_reason.is_none()
            && self.labels.is_none()
            && self.assignees.is_none()
    }
}

/// State filter for issue listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    Open,
    Closed,
    #[default]
    All,
}

impl StateFilter {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }
}

/// Query for issue listing.
#[derive(Debug, Clone, Default)]
pub struct IssueQuery {
    pub state: StateFilter,
    /// Label names the issue must carry (all of them).
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    /// Only issues updated at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub per_page: Option<u32>,
    pub page: Option<u32>,
}

/// A comment on an issue.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueComment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Typed operations against the forge issue tracker.
///
/// Implementations own authentication, the per-call deadline, and transport
/// level rate-limit handling; callers only see [`GatewayError`] kinds.
#[async_trait]
pub trait ForgeGateway: Send + Sync {
    /// The `owner/repo` slug this gateway is bound to.
    fn repo(&self) -> &str;

    /// Creates an issue and returns it.
    async fn create_issue(&self, issue: &NewIssue) -> Result<ForgeIssue, GatewayError>;

    /// Reads a single issue.
    async fn get_issue(&self, number: u64) -> Result<ForgeIssue, GatewayError>;

    /// Applies a partial update to an issue.
    async fn update_issue(&self, number: u64, patch: &IssuePatch)
        -> Result<ForgeIssue, GatewayError>;

    /// Lists issues matching the query. Pull requests are excluded.
    async fn list_issues(&self, query: &IssueQuery) -> Result<Vec<ForgeIssue>, GatewayError>;

    /// Adds a comment and returns its id.
    async fn add_comment(&self, number: u64, body: &str) -> Result<u64, GatewayError>;

    /// Lists comments on an issue.
    async fn list_comments(&self, number: u64) -> Result<Vec<IssueComment>, GatewayError>;
}
