//! Mapping repository.
//!
//! Bindings are write-once: the external id is how the row is found again,
//! so replacing a set reference is a constraint violation, not an update.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use taskbridge_core::model::{ForgeIssueRef, Mapping, SheetRecordRef, SyncStatus};

use super::{decode_opt_ts, decode_ts, encode_ts, StoreError};

const COLUMNS: &str = "mapping_id, task_id, forge_repo, forge_issue_number, sheet_app_token, \
                       sheet_table_id, sheet_record_id, sync_status, last_synced_at, \
                       sheet_content_hash, created_at, updated_at";

pub fn insert(conn: &Connection, mapping: &Mapping) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO mappings (mapping_id, task_id, forge_repo, forge_issue_number, \
         sheet_app_token, sheet_table_id, sheet_record_id, sync_status, last_synced_at, \
         sheet_content_hash, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            mapping.mapping_id,
            mapping.task_id,
            mapping.forge.as_ref().map(|forge| forge.repo.as_str()),
            mapping.forge.as_ref().map(|forge| i64::try_from(forge.number).unwrap_or(i64::MAX)),
            mapping.sheet.as_ref().map(|sheet| sheet.app_token.as_str()),
            mapping.sheet.as_ref().map(|sheet| sheet.table_id.as_str()),
            mapping.sheet.as_ref().map(|sheet| sheet.record_id.as_str()),
            mapping.sync_status.as_str(),
            mapping.last_synced_at.map(encode_ts),
            mapping.sheet_content_hash.as_deref(),
            encode_ts(mapping.created_at),
            encode_ts(mapping.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_by_task(conn: &Connection, task_id: &str) -> Result<Option<Mapping>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM mappings WHERE task_id = ?1"),
            params![task_id],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

/// Like [`get_by_task`], but a missing row is an error.
pub fn require_by_task(conn: &Connection, task_id: &str) -> Result<Mapping, StoreError> {
    get_by_task(conn, task_id)?.ok_or_else(|| StoreError::NotFound {
        what: "mapping",
        id: task_id.to_owned(),
    })
}

pub fn get_by_forge_ref(
    conn: &Connection,
    forge: &ForgeIssueRef,
) -> Result<Option<Mapping>, StoreError> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM mappings \
                 WHERE forge_repo = ?1 AND forge_issue_number = ?2"
            ),
            params![forge.repo, i64::try_from(forge.number).unwrap_or(i64::MAX)],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

pub fn get_by_sheet_record(
    conn: &Connection,
    record_id: &str,
) -> Result<Option<Mapping>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM mappings WHERE sheet_record_id = ?1"),
            params![record_id],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

/// Binds the forge reference. Setting the same reference again is a no-op;
/// replacing an existing one is refused.
pub fn set_forge_ref(
    conn: &Connection,
    task_id: &str,
    forge: &ForgeIssueRef,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let current = require_by_task(conn, task_id)?;
    match &current.forge {
        Some(existing) if existing == forge => return Ok(()),
        Some(existing) => {
            return Err(StoreError::Constraint(format!(
                "task {task_id} is already bound to forge issue {}#{}",
                existing.repo, existing.number
            )));
        }
        None => {}
    }
    conn.execute(
        "UPDATE mappings SET forge_repo = ?2, forge_issue_number = ?3, updated_at = ?4 \
         WHERE task_id = ?1",
        params![
            task_id,
            forge.repo,
            i64::try_from(forge.number).unwrap_or(i64::MAX),
            encode_ts(now),
        ],
    )?;
    Ok(())
}

/// Binds the sheet reference, with the same write-once discipline.
pub fn set_sheet_ref(
    conn: &Connection,
    task_id: &str,
    sheet: &SheetRecordRef,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let current = require_by_task(conn, task_id)?;
    match &current.sheet {
        Some(existing) if existing == sheet => return Ok(()),
        Some(existing) => {
            return Err(StoreError::Constraint(format!(
                "task {task_id} is already bound to sheet record {}",
                existing.record_id
            )));
        }
        None => {}
    }
    conn.execute(
        "UPDATE mappings SET sheet_app_token = ?2, sheet_table_id = ?3, sheet_record_id = ?4, \
         updated_at = ?5
         WHERE task_id = ?1",
        params![
            task_id,
            sheet.app_token,
            sheet.table_id,
            sheet.record_id,
            encode_ts(now),
        ],
    )?;
    Ok(())
}

pub fn set_sync_status(
    conn: &Connection,
    task_id: &str,
    status: SyncStatus,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE mappings SET sync_status = ?2, updated_at = ?3 WHERE task_id = ?1",
        params![task_id, status.as_str(), encode_ts(now)],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound {
            what: "mapping",
            id: task_id.to_owned(),
        });
    }
    Ok(())
}

/// Advances the reconciliation watermark, optionally recording the sheet
/// content hash observed at that point.
pub fn set_reconciled(
    conn: &Connection,
    task_id: &str,
    at: DateTime<Utc>,
    sheet_content_hash: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE mappings SET last_synced_at = ?2, \
         sheet_content_hash = COALESCE(?3, sheet_content_hash), updated_at = ?4
         WHERE task_id = ?1",
        params![task_id, encode_ts(at), sheet_content_hash, encode_ts(now)],
    )?;
    Ok(())
}

struct RawMapping {
    mapping_id: String,
    task_id: String,
    forge_repo: Option<String>,
    forge_issue_number: Option<i64>,
    sheet_app_token: Option<String>,
    sheet_table_id: Option<String>,
    sheet_record_id: Option<String>,
    sync_status: String,
    last_synced_at: Option<String>,
    sheet_content_hash: Option<String>,
    created_at: String,
    updated_at: String,
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawMapping> {
    Ok(RawMapping {
        mapping_id: row.get(0)?,
        task_id: row.get(1)?,
        forge_repo: row.get(2)?,
        forge_issue_number: row.get(3)?,
        sheet_app_token: row.get(4)?,
        sheet_table_id: row.get(5)?,
        sheet_record_id: row.get(6)?,
        sync_status: row.get(7)?,
        last_synced_at: row.get(8)?,
        sheet_content_hash: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn from_raw(raw: RawMapping) -> Result<Mapping, StoreError> {
    let forge = match (raw.forge_repo, raw.forge_issue_number) {
        (Some(repo), Some(number)) => Some(ForgeIssueRef::new(repo, number.unsigned_abs())),
        _ => None,
    };
    let sheet = match (raw.sheet_app_token, raw.sheet_table_id, raw.sheet_record_id) {
        (Some(app_token), Some(table_id), Some(record_id)) => {
            Some(SheetRecordRef::new(app_token, table_id, record_id))
        }
        _ => None,
    };
    let sync_status = SyncStatus::parse(&raw.sync_status).ok_or_else(|| {
        StoreError::Constraint(format!("unknown sync status {:?}", raw.sync_status))
    })?;
    Ok(Mapping {
        mapping_id: raw.mapping_id,
        task_id: raw.task_id,
        forge,
        sheet,
        sync_status,
        last_synced_at: decode_opt_ts(raw.last_synced_at)?,
        sheet_content_hash: raw.sheet_content_hash,
        created_at: decode_ts(&raw.created_at)?,
        updated_at: decode_ts(&raw.updated_at)?,
    })
}
