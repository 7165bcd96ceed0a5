//! Outbox repository: durable queue of pending external side effects.
//!
//! Claiming flips rows from `pending` to `processing` inside one
//! transaction, which is the whole mutual-exclusion story for multiple
//! dispatcher workers. Two invariants hold:
//!
//! - no two in-flight events share a task id, and
//! - per task, only the oldest pending event is claimable, so a backed-off
//!   head blocks the tail and enqueue order survives retries.
//!
//! Abandoned claims (a worker crashed mid-dispatch) return to `pending`
//! once their `processing_at` passes the reclaim threshold.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{decode_ts, encode_ts, StoreError};
use crate::event::{EventPayload, EventStatus, OutboxEvent};

const COLUMNS: &str =
    "event_id, payload, status, attempts, max_attempts, last_error, not_before, created_at";

/// Enqueues an event, immediately eligible for claiming.
pub fn enqueue(
    conn: &Connection,
    payload: &EventPayload,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<String, StoreError> {
    let event_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO outbox (event_id, kind, payload, task_id, status, attempts, max_attempts, \
         not_before, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?6, ?6)",
        params![
            event_id,
            payload.kind(),
            serde_json::to_string(payload)?,
            payload.task_id(),
            max_attempts,
            encode_ts(now),
        ],
    )?;
    Ok(event_id)
}

/// Reclaims abandoned in-flight events and claims up to `limit` eligible
/// pending events, flipping them to `processing`.
pub fn claim(
    conn: &Connection,
    limit: usize,
    now: DateTime<Utc>,
    reclaim_after: Duration,
) -> Result<Vec<OutboxEvent>, StoreError> {
    let cutoff = now
        - chrono::Duration::from_std(reclaim_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
    conn.execute(
        "UPDATE outbox SET status = 'pending', processing_at = NULL, updated_at = ?1
         WHERE status = 'processing' AND processing_at < ?2",
        params![encode_ts(now), encode_ts(cutoff)],
    )?;

    let mut in_flight: HashSet<String> = HashSet::new();
    {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT task_id FROM outbox \
             WHERE status = 'processing' AND task_id IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for task_id in rows {
            in_flight.insert(task_id?);
        }
    }

    let candidates = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS}, task_id FROM outbox WHERE status = 'pending' \
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((raw_from_row(row)?, row.get::<_, Option<String>>(8)?))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut claimed = Vec::new();
    for (raw, task_id) in candidates {
        if claimed.len() >= limit {
            break;
        }
        if let Some(task_id) = task_id {
            if in_flight.contains(&task_id) {
                continue;
            }
            // Whether claimable or still backed off, this event is the head
            // of its task's queue; later events of the task must wait.
            in_flight.insert(task_id);
        }
        let event = from_raw(raw)?;
        if event.not_before > now {
            continue;
        }
        claimed.push(event);
    }

    for event in &mut claimed {
        conn.execute(
            "UPDATE outbox SET status = 'processing', processing_at = ?2, updated_at = ?2
             WHERE event_id = ?1",
            params![event.event_id, encode_ts(now)],
        )?;
        event.status = EventStatus::Processing;
    }
    Ok(claimed)
}

pub fn mark_sent(conn: &Connection, event_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
    transition(conn, event_id, "sent", None, now)
}

/// Returns a transiently failed event to the queue with a backoff window.
pub fn retry(
    conn: &Connection,
    event_id: &str,
    error: &str,
    not_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE outbox SET status = 'pending', attempts = attempts + 1, last_error = ?2, \
         not_before = ?3, processing_at = NULL, updated_at = ?4
         WHERE event_id = ?1",
        params![event_id, error, encode_ts(not_before), encode_ts(now)],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound {
            what: "outbox event",
            id: event_id.to_owned(),
        });
    }
    Ok(())
}

/// Dead-letters an event. Dead events are retained for audit and never
/// return to `pending` without operator action.
pub fn mark_dead(
    conn: &Connection,
    event_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    transition(conn, event_id, "dead", Some(error), now)
}

fn transition(
    conn: &Connection,
    event_id: &str,
    status: &str,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE outbox SET status = ?2, attempts = attempts + 1, \
         last_error = COALESCE(?3, last_error), processing_at = NULL, updated_at = ?4
         WHERE event_id = ?1",
        params![event_id, status, error, encode_ts(now)],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound {
            what: "outbox event",
            id: event_id.to_owned(),
        });
    }
    Ok(())
}

pub fn get(conn: &Connection, event_id: &str) -> Result<Option<OutboxEvent>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM outbox WHERE event_id = ?1"),
            params![event_id],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

/// Whether a non-terminal event of the given kind targets the task.
pub fn has_open_kind(conn: &Connection, task_id: &str, kind: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox \
         WHERE task_id = ?1 AND kind = ?2 AND status IN ('pending', 'processing')",
        params![task_id, kind],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Non-terminal events serialized against one task.
pub fn open_for_task(conn: &Connection, task_id: &str) -> Result<u64, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox \
         WHERE task_id = ?1 AND status IN ('pending', 'processing')",
        params![task_id],
        |row| row.get(0),
    )?;
    Ok(count.unsigned_abs())
}

/// Events not yet terminal (`pending` or `processing`).
pub fn open_count(conn: &Connection) -> Result<u64, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE status IN ('pending', 'processing')",
        [],
        |row| row.get(0),
    )?;
    Ok(count.unsigned_abs())
}

/// All events in a given status, oldest first. Used by tests and the ops
/// surface.
pub fn list_by_status(
    conn: &Connection,
    status: EventStatus,
) -> Result<Vec<OutboxEvent>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM outbox WHERE status = ?1 ORDER BY created_at ASC, rowid ASC"
    ))?;
    let raws = stmt
        .query_map(params![status.as_str()], raw_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(from_raw).collect()
}

struct RawEvent {
    event_id: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    not_before: String,
    created_at: String,
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        event_id: row.get(0)?,
        payload: row.get(1)?,
        status: row.get(2)?,
        attempts: row.get(3)?,
        max_attempts: row.get(4)?,
        last_error: row.get(5)?,
        not_before: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn from_raw(raw: RawEvent) -> Result<OutboxEvent, StoreError> {
    let payload: EventPayload = serde_json::from_str(&raw.payload)?;
    let status = EventStatus::parse(&raw.status)
        .ok_or_else(|| StoreError::Constraint(format!("unknown event status {:?}", raw.status)))?;
    Ok(OutboxEvent {
        event_id: raw.event_id,
        payload,
        status,
        attempts: u32::try_from(raw.attempts).unwrap_or(0),
        max_attempts: u32::try_from(raw.max_attempts).unwrap_or(0),
        last_error: raw.last_error,
        not_before: decode_ts(&raw.not_before)?,
        created_at: decode_ts(&raw.created_at)?,
    })
}
