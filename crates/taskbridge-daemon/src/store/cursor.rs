//! Per-source reconciliation cursors.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{decode_ts, encode_ts, StoreError};

pub fn get_raw(conn: &Connection, source: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT value FROM sync_state WHERE source = ?1",
            params![source],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn set_raw(
    conn: &Connection,
    source: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sync_state (source, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(source) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![source, value, encode_ts(now)],
    )?;
    Ok(())
}

/// Reads a timestamp cursor.
pub fn get_time(conn: &Connection, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    get_raw(conn, source)?
        .map(|raw| decode_ts(&raw))
        .transpose()
}

/// Advances a timestamp cursor. The stored value never moves backwards.
pub fn advance_time(
    conn: &Connection,
    source: &str,
    candidate: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, StoreError> {
    let current = get_time(conn, source)?;
    let next = current.map_or(candidate, |existing| existing.max(candidate));
    set_raw(conn, source, &encode_ts(next), now)?;
    Ok(next)
}
