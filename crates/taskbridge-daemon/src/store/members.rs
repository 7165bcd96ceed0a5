//! Member repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use taskbridge_core::model::{Member, MemberRole, MemberStatus, SheetTableRef};

use super::{decode_ts, encode_ts, StoreError};

const COLUMNS: &str = "member_id, name, email, forge_username, sheet_open_id, role, position, \
                       team, status, table_assignments, created_at, updated_at";

/// Filter for member listing.
#[derive(Debug, Clone, Default)]
pub struct MemberFilter {
    pub status: Option<MemberStatus>,
    pub role: Option<MemberRole>,
}

pub fn insert(conn: &Connection, member: &Member) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO members (member_id, name, email, forge_username, sheet_open_id, role, \
         position, team, status, table_assignments, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            member.member_id,
            member.name,
            member.email,
            member.forge_username,
            member.sheet_open_id,
            member.role.as_str(),
            member.position,
            member.team,
            member.status.as_str(),
            serde_json::to_string(&member.table_assignments)?,
            encode_ts(member.created_at),
            encode_ts(member.updated_at),
        ],
    )?;
    Ok(())
}

/// Writes the full row back. The caller owns bumping `updated_at`.
pub fn update(conn: &Connection, member: &Member) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE members SET name = ?2, email = ?3, forge_username = ?4, sheet_open_id = ?5, \
         role = ?6, position = ?7, team = ?8, status = ?9, table_assignments = ?10, \
         updated_at = ?11
         WHERE member_id = ?1",
        params![
            member.member_id,
            member.name,
            member.email,
            member.forge_username,
            member.sheet_open_id,
            member.role.as_str(),
            member.position,
            member.team,
            member.status.as_str(),
            serde_json::to_string(&member.table_assignments)?,
            encode_ts(member.updated_at),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound {
            what: "member",
            id: member.member_id.clone(),
        });
    }
    Ok(())
}

/// Caches resolved identities on the row. `None` facets are left as-is.
pub fn set_identity(
    conn: &Connection,
    member_id: &str,
    forge_username: Option<&str>,
    sheet_open_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE members SET \
         forge_username = COALESCE(?2, forge_username), \
         sheet_open_id = COALESCE(?3, sheet_open_id), \
         updated_at = ?4
         WHERE member_id = ?1",
        params![member_id, forge_username, sheet_open_id, encode_ts(now)],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, member_id: &str) -> Result<Option<Member>, StoreError> {
    find_one(conn, "member_id = ?1", member_id)
}

pub fn find_by_email(conn: &Connection, email: &str) -> Result<Option<Member>, StoreError> {
    find_one(conn, "email = ?1", email)
}

pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Member>, StoreError> {
    find_one(conn, "name = ?1", name)
}

pub fn find_by_forge_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<Member>, StoreError> {
    find_one(conn, "forge_username = ?1", username)
}

pub fn find_by_sheet_open_id(
    conn: &Connection,
    open_id: &str,
) -> Result<Option<Member>, StoreError> {
    find_one(conn, "sheet_open_id = ?1", open_id)
}

pub fn list(conn: &Connection, filter: &MemberFilter) -> Result<Vec<Member>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM members ORDER BY name"))?;
    let raws = stmt
        .query_map([], raw_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut members = Vec::with_capacity(raws.len());
    for raw in raws {
        let member = from_raw(raw)?;
        if filter.status.is_some_and(|status| member.status != status) {
            continue;
        }
        if filter.role.is_some_and(|role| member.role != role) {
            continue;
        }
        members.push(member);
    }
    Ok(members)
}

fn find_one(
    conn: &Connection,
    predicate: &str,
    value: &str,
) -> Result<Option<Member>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM members WHERE {predicate}"),
            params![value],
            raw_from_row,
        )
        .optional()?;
    raw.map(from_raw).transpose()
}

struct RawMember {
    member_id: String,
    name: String,
    email: String,
    forge_username: Option<String>,
    sheet_open_id: Option<String>,
    role: String,
    position: Option<String>,
    team: Option<String>,
    status: String,
    table_assignments: String,
    created_at: String,
    updated_at: String,
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawMember> {
    Ok(RawMember {
        member_id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        forge_username: row.get(3)?,
        sheet_open_id: row.get(4)?,
        role: row.get(5)?,
        position: row.get(6)?,
        team: row.get(7)?,
        status: row.get(8)?,
        table_assignments: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn from_raw(raw: RawMember) -> Result<Member, StoreError> {
    let role = MemberRole::parse(&raw.role)
        .ok_or_else(|| StoreError::Constraint(format!("unknown role {:?}", raw.role)))?;
    let status = MemberStatus::parse(&raw.status)
        .ok_or_else(|| StoreError::Constraint(format!("unknown member status {:?}", raw.status)))?;
    let table_assignments: Vec<SheetTableRef> = serde_json::from_str(&raw.table_assignments)?;
    Ok(Member {
        member_id: raw.member_id,
        name: raw.name,
        email: raw.email,
        forge_username: raw.forge_username,
        sheet_open_id: raw.sheet_open_id,
        role,
        position: raw.position,
        team: raw.team,
        status,
        table_assignments,
        created_at: decode_ts(&raw.created_at)?,
        updated_at: decode_ts(&raw.updated_at)?,
    })
}
