//! Mapping groups: every stored row sharing one exact legacy identity string.
//!
//! Grouping is byte-for-byte. "Smith" and "Smith " are two groups and are
//! mapped independently; nothing here tries to guess that they are one person.

use crate::accounts;
use crate::db;
use crate::error::{ImportError, Result};
use crate::ledger::{LegacyAttendanceRecord, RECORD_COLUMNS};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Mapped,
    Unmapped,
    /// Only reachable through out-of-band edits; shown so it can be repaired.
    Mixed,
}

impl MappingState {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingState::Mapped => "mapped",
            MappingState::Unmapped => "unmapped",
            MappingState::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MappingGroup {
    pub legacy_identity: String,
    pub records: Vec<LegacyAttendanceRecord>,
}

impl MappingGroup {
    pub fn state(&self) -> MappingState {
        let mut users = self.records.iter().map(|r| r.mapped_user_id);
        let Some(first) = users.next() else {
            return MappingState::Unmapped;
        };
        if users.any(|u| u != first) {
            MappingState::Mixed
        } else if first.is_some() {
            MappingState::Mapped
        } else {
            MappingState::Unmapped
        }
    }

    pub fn mapped_user_id(&self) -> Option<i64> {
        match self.state() {
            MappingState::Mapped => self.records.first().and_then(|r| r.mapped_user_id),
            MappingState::Unmapped | MappingState::Mixed => None,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "legacyIdentity": self.legacy_identity,
            "state": self.state().as_str(),
            "isMapped": self.state() == MappingState::Mapped,
            "mappedUserId": self.mapped_user_id(),
            "recordCount": self.records.len(),
            "records": self.records.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
        })
    }
}

pub fn list_groups(conn: &Connection) -> rusqlite::Result<Vec<MappingGroup>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM legacy_attendance ORDER BY legacy_identity, event_date"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], LegacyAttendanceRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut groups: Vec<MappingGroup> = Vec::new();
    for r in rows {
        if let Some(g) = groups
            .last_mut()
            .filter(|g| g.legacy_identity == r.legacy_identity)
        {
            g.records.push(r);
            continue;
        }
        groups.push(MappingGroup {
            legacy_identity: r.legacy_identity.clone(),
            records: vec![r],
        });
    }
    Ok(groups)
}

/// Binds every row of the group to `user_id` in one transaction. Returns the
/// number of rows in the group.
pub fn propose_mapping(conn: &Connection, legacy_identity: &str, user_id: i64) -> Result<usize> {
    let tx = db::begin_immediate(conn)?;
    if !accounts::account_exists(&tx, user_id)? {
        return Err(ImportError::IdentityNotFound(format!("account {user_id}")));
    }
    let updated = tx.execute(
        "UPDATE legacy_attendance
         SET mapped_user_id = ?, is_mapped = 1, updated_at = ?
         WHERE legacy_identity = ?",
        (user_id, Utc::now().to_rfc3339(), legacy_identity),
    )?;
    if updated == 0 {
        return Err(ImportError::IdentityNotFound(format!(
            "legacy identity {legacy_identity:?}"
        )));
    }
    tx.commit()?;
    info!(legacy_identity, user_id, rows = updated, "legacy identity mapped");
    Ok(updated)
}

pub fn clear_mapping(conn: &Connection, legacy_identity: &str) -> Result<usize> {
    let tx = db::begin_immediate(conn)?;
    let updated = tx.execute(
        "UPDATE legacy_attendance
         SET mapped_user_id = NULL, is_mapped = 0, updated_at = ?
         WHERE legacy_identity = ?",
        (Utc::now().to_rfc3339(), legacy_identity),
    )?;
    if updated == 0 {
        return Err(ImportError::IdentityNotFound(format!(
            "legacy identity {legacy_identity:?}"
        )));
    }
    tx.commit()?;
    info!(legacy_identity, rows = updated, "legacy identity unmapped");
    Ok(updated)
}
