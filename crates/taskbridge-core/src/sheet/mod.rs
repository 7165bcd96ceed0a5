//! Typed facade over the sheet database.

pub mod lark;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::gateway::GatewayError;
use crate::model::{SheetRecordRef, SheetTableRef};

/// Field-name keyed record payload, exactly as the sheet stores it.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// A record as read from a sheet table.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRecord {
    pub record_id: String,
    pub fields: JsonMap,
    /// Server-side last-modified instant, when the table exposes one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Query for record search.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// Only records whose named last-modified column is at or after this
    /// instant. Requires the table to have such a column; without it the
    /// search is a full scan.
    pub modified_since: Option<(String, DateTime<Utc>)>,
    pub page_size: Option<u32>,
}

/// A column definition used for table bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetFieldDef {
    pub name: String,
    /// Vendor column type code (1 text, 3 single-select, 5 date, 11 user).
    pub kind: u32,
    /// Options for single-select columns.
    pub options: Vec<String>,
}

/// Table metadata from listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTableInfo {
    pub table_id: String,
    pub name: String,
}

/// Destination of an operator-visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// A member, addressed by resolved open id.
    OpenId(String),
    /// A chat, addressed by chat id.
    Chat(String),
}

impl MessageTarget {
    #[must_use]
    pub fn receive_id(&self) -> &str {
        match self {
            Self::OpenId(id) | Self::Chat(id) => id,
        }
    }

    #[must_use]
    pub const fn id_type(&self) -> &'static str {
        match self {
            Self::OpenId(_) => "open_id",
            Self::Chat(_) => "chat_id",
        }
    }
}

/// Typed operations against the sheet database.
#[async_trait]
pub trait SheetGateway: Send + Sync {
    /// Creates a record and returns its id.
    async fn create_record(
        &self,
        table: &SheetTableRef,
        fields: &JsonMap,
    ) -> Result<String, GatewayError>;

    /// Reads a single record.
    async fn get_record(&self, record: &SheetRecordRef) -> Result<SheetRecord, GatewayError>;

    /// Updates fields on an existing record.
    async fn update_record(
        &self,
        record: &SheetRecordRef,
        fields: &JsonMap,
    ) -> Result<(), GatewayError>;

    /// Searches records in a table.
    async fn search_records(
        &self,
        table: &SheetTableRef,
        query: &RecordQuery,
    ) -> Result<Vec<SheetRecord>, GatewayError>;

    /// Resolves a member's open id from their email, `None` when unknown.
    async fn lookup_open_id(&self, email: &str) -> Result<Option<String>, GatewayError>;

    /// Sends a plain text message.
    async fn send_text(&self, target: &MessageTarget, text: &str) -> Result<(), GatewayError>;

    /// Lists the tables of a sheet app.
    async fn list_tables(&self, app_token: &str) -> Result<Vec<SheetTableInfo>, GatewayError>;

    /// Creates a table with the given columns and returns its id.
    async fn create_table(
        &self,
        app_token: &str,
        name: &str,
        fields: &[SheetFieldDef],
    ) -> Result<String, GatewayError>;
}
