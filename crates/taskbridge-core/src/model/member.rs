//! Member identity across both external stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::registry::SheetTableRef;

/// Team role of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Manager,
    Developer,
    Designer,
    Qa,
    Member,
}

impl MemberRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Manager => "manager",
            Self::Developer => "developer",
            Self::Designer => "designer",
            Self::Qa => "qa",
            Self::Member => "member",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "admin" => Some(Self::Admin),
            "manager" => Some(Self::Manager),
            "developer" => Some(Self::Developer),
            "designer" => Some(Self::Designer),
            "qa" => Some(Self::Qa),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

impl Default for MemberRole {
    fn default() -> Self {
        Self::Member
    }
}

/// Whether a member is active. Members are never deleted, only deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Inactive,
}

impl MemberStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Canonical member identity.
///
/// The email is the stable key; the forge username and the sheet open id are
/// resolved facets cached on the row by the identity resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub name: String,
    pub email: String,
    pub forge_username: Option<String>,
    pub sheet_open_id: Option<String>,
    pub role: MemberRole,
    pub position: Option<String>,
    pub team: Option<String>,
    pub status: MemberStatus,
    pub table_assignments: Vec<SheetTableRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            member_id: Uuid::new_v4().to_string(),
            name: name.into(),
            email: email.into(),
            forge_username: None,
            sheet_open_id: None,
            role: MemberRole::default(),
            position: None,
            team: None,
            status: MemberStatus::Active,
            table_assignments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, MemberStatus::Active)
    }
}
