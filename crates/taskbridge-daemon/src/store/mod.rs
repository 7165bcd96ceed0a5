//! The durable store: one embedded sqlite database behind a writer lock.
//!
//! All state lives here: entities, mappings, the outbox, reconciliation
//! cursors, and the sync log. Mutations go through [`Store::transaction`],
//! which serializes writers and rolls back on any error; every committed
//! transaction is durable (WAL) before an outbox consumer can observe its
//! event. Repositories are modules of free functions over `&Connection`
//! so multiple repository calls compose inside one transaction.

pub mod audit;
pub mod cursor;
pub mod mappings;
pub mod members;
pub mod outbox;
pub mod registry;
mod schema;
pub mod tasks;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

/// Store failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("schema migration error: {0}")]
    Migration(String),

    #[error("malformed timestamp {0:?}")]
    Timestamp(String),
}

/// Handle to the embedded database. Cheap to clone; clones share one
/// connection and therefore one writer at a time.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (and migrates) the database at `path`, creating parent
    /// directories as needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Migration(format!("create {parent:?}: {err}")))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// An in-memory database, for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside one immediate transaction, committing on `Ok` and
    /// rolling back on `Err`. The transaction holds the writer lock for its
    /// whole extent; reads inside it see a consistent snapshot.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Runs a read-only closure against the connection.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }
}

/// Canonical timestamp encoding for TEXT columns.
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(raw.to_owned()))
}

pub(crate) fn decode_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|value| decode_ts(&value)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = Store::in_memory().unwrap();
        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.execute(
                "INSERT INTO sync_state (source, value, updated_at) VALUES ('x', '1', '2025-01-01T00:00:00Z')",
                [],
            )?;
            Err(StoreError::Constraint("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM sync_state", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let decoded = decode_ts(&encode_ts(now)).unwrap();
        assert_eq!(decoded, now);
        assert!(decode_ts("not-a-time").is_err());
    }
}
