//! Append-only sync log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::{decode_ts, encode_ts, StoreError};

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: String,
    /// `inbound`, `outbound`, or `local`.
    pub direction: String,
    pub subject: String,
    pub subject_id: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn append(
    conn: &Connection,
    direction: &str,
    subject: &str,
    subject_id: Option<&str>,
    status: &str,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sync_log (id, direction, subject, subject_id, status, message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            direction,
            subject,
            subject_id,
            status,
            message,
            encode_ts(now),
        ],
    )?;
    Ok(())
}

/// Entries for one subject, oldest first.
pub fn list_for(
    conn: &Connection,
    subject: &str,
    subject_id: &str,
) -> Result<Vec<AuditEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, direction, subject, subject_id, status, message, created_at
         FROM sync_log WHERE subject = ?1 AND subject_id = ?2 ORDER BY created_at",
    )?;
    let raws = stmt
        .query_map(params![subject, subject_id], raw_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter()
        .map(|(entry, created_at)| {
            Ok(AuditEntry {
                created_at: decode_ts(&created_at)?,
                ..entry
            })
        })
        .collect()
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<(AuditEntry, String)> {
    Ok((
        AuditEntry {
            id: row.get(0)?,
            direction: row.get(1)?,
            subject: row.get(2)?,
            subject_id: row.get(3)?,
            status: row.get(4)?,
            message: row.get(5)?,
            created_at: DateTime::<Utc>::MIN_UTC,
        },
        row.get(6)?,
    ))
}
