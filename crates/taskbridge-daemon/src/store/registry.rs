//! Sheet table registry repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use taskbridge_core::model::{FieldMap, SheetTableRef, TableRegistryEntry};

use super::{encode_ts, StoreError};

const COLUMNS: &str = "app_token, table_id, display_name, field_map, is_default";

/// Registers or replaces a table. Marking an entry as default clears the
/// flag on every other entry, so at most one default exists.
pub fn upsert(
    conn: &Connection,
    entry: &TableRegistryEntry,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if entry.is_default {
        conn.execute("UPDATE sheet_tables SET is_default = 0", [])?;
    }
    conn.execute(
        "INSERT INTO sheet_tables (app_token, table_id, display_name, field_map, is_default, \
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(app_token, table_id) DO UPDATE SET
             display_name = excluded.display_name,
             field_map = excluded.field_map,
             is_default = excluded.is_default,
             updated_at = excluded.updated_at",
        params![
            entry.table.app_token,
            entry.table.table_id,
            entry.display_name,
            serde_json::to_string(&entry.fields)?,
            i32::from(entry.is_default),
            encode_ts(now),
        ],
    )?;
    Ok(())
}

pub fn get(
    conn: &Connection,
    table: &SheetTableRef,
) -> Result<Option<TableRegistryEntry>, StoreError> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM sheet_tables WHERE app_token = ?1 AND table_id = ?2"
            ),
            params![table.app_token, table.table_id],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

/// Like [`get`], but a missing entry is an error: every sheet binding must
/// reference a registered table.
pub fn require(conn: &Connection, table: &SheetTableRef) -> Result<TableRegistryEntry, StoreError> {
    get(conn, table)?.ok_or_else(|| StoreError::NotFound {
        what: "sheet table",
        id: table.to_string(),
    })
}

pub fn get_default(conn: &Connection) -> Result<Option<TableRegistryEntry>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM sheet_tables WHERE is_default = 1"),
            [],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

pub fn get_by_name(
    conn: &Connection,
    display_name: &str,
) -> Result<Option<TableRegistryEntry>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM sheet_tables WHERE display_name = ?1"),
            params![display_name],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

pub fn list(conn: &Connection) -> Result<Vec<TableRegistryEntry>, StoreError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {COLUMNS} FROM sheet_tables ORDER BY display_name"))?;
    let raws = stmt
        .query_map([], raw_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(from_raw).collect()
}

struct RawEntry {
    app_token: String,
    table_id: String,
    display_name: String,
    field_map: String,
    is_default: i64,
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        app_token: row.get(0)?,
        table_id: row.get(1)?,
        display_name: row.get(2)?,
        field_map: row.get(3)?,
        is_default: row.get(4)?,
    })
}

fn from_raw(raw: RawEntry) -> Result<TableRegistryEntry, StoreError> {
    let fields: FieldMap = serde_json::from_str(&raw.field_map)?;
    Ok(TableRegistryEntry {
        table: SheetTableRef::new(raw.app_token, raw.table_id),
        display_name: raw.display_name,
        fields,
        is_default: raw.is_default != 0,
    })
}
