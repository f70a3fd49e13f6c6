//! Stored legacy attendance rows and the preview/commit pipeline over them.
//!
//! Preview never writes. Commit re-reads and re-checks everything inside one
//! immediate transaction, so a batch is either fully applied or not at all.

use crate::db;
use crate::error::{ImportError, Result, StaleEvidence};
use crate::matrix::{self, Candidate, ImportBatch, ParseOptions, RecordKey};
use crate::reconcile::{self, ExistingState, Reconciliation, Resolution};
use crate::status::Status;
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, Row};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};
use uuid::Uuid;

pub const RECORD_COLUMNS: &str =
    "id, legacy_identity, event_date, status, mapped_user_id, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAttendanceRecord {
    /// `None` for preview rows that have not been written.
    pub id: Option<String>,
    pub legacy_identity: String,
    pub event_date: NaiveDate,
    pub status: Status,
    pub mapped_user_id: Option<i64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl LegacyAttendanceRecord {
    pub fn is_mapped(&self) -> bool {
        self.mapped_user_id.is_some()
    }

    pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(r.get(0)?),
            legacy_identity: r.get(1)?,
            event_date: r.get(2)?,
            status: r.get(3)?,
            mapped_user_id: r.get(4)?,
            created_at: Some(r.get(5)?),
            updated_at: r.get(6)?,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "legacyIdentity": self.legacy_identity,
            "eventDate": self.event_date.to_string(),
            "canonicalStatus": self.status.as_str(),
            "isMapped": self.is_mapped(),
            "mappedUserId": self.mapped_user_id,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

pub struct Preview {
    pub batch: ImportBatch,
    pub reconciliation: Reconciliation,
    pub records: Vec<LegacyAttendanceRecord>,
    pub token: String,
}

impl Preview {
    pub fn to_json(&self) -> Value {
        json!({
            "imported": self.reconciliation.new.len(),
            "preview": self.records.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
            "conflicts": self
                .reconciliation
                .conflicts
                .iter()
                .map(|c| c.to_json())
                .collect::<Vec<_>>(),
            "processedCells": self.batch.processed_cells,
            "skippedCells": self.batch.skipped_cells,
            "duplicateCells": self.batch.duplicate_cells,
            "excusedTokens": self.batch.excused_tokens,
            "unrecognizedTokens": self.batch.unrecognized_tokens,
            "satisfied": self.reconciliation.satisfied.len(),
            "dates": self.batch.dates.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            "previewToken": self.token,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub kept_existing: usize,
    pub satisfied: usize,
}

impl CommitOutcome {
    pub fn imported(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn to_json(&self) -> Value {
        json!({
            "imported": self.imported(),
            "inserted": self.inserted,
            "updated": self.updated,
            "keptExisting": self.kept_existing,
            "satisfied": self.satisfied,
        })
    }
}

/// Stored status for every candidate key that already has a row.
pub fn load_existing(conn: &Connection, candidates: &[Candidate]) -> rusqlite::Result<ExistingState> {
    let wanted: BTreeSet<&RecordKey> = candidates.iter().map(|c| &c.key).collect();
    let identities: BTreeSet<&str> = wanted.iter().map(|k| k.legacy_identity.as_str()).collect();
    let mut stmt = conn.prepare(
        "SELECT event_date, status FROM legacy_attendance WHERE legacy_identity = ?",
    )?;
    let mut out = ExistingState::new();
    for identity in identities {
        let rows = stmt
            .query_map([identity], |r| {
                Ok((r.get::<_, NaiveDate>(0)?, r.get::<_, Status>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (date, status) in rows {
            let key = RecordKey::new(identity, date);
            if wanted.contains(&key) {
                out.insert(key, status);
            }
        }
    }
    Ok(out)
}

/// Account each group is bound to, for groups that are mapped.
pub fn group_mappings<'a>(
    conn: &Connection,
    identities: impl IntoIterator<Item = &'a str>,
) -> rusqlite::Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare(
        "SELECT mapped_user_id FROM legacy_attendance
         WHERE legacy_identity = ? AND mapped_user_id IS NOT NULL
         LIMIT 1",
    )?;
    let mut out = HashMap::new();
    for identity in identities {
        let mut rows = stmt.query([identity])?;
        if let Some(row) = rows.next()? {
            out.insert(identity.to_string(), row.get(0)?);
        }
    }
    Ok(out)
}

pub fn preview(conn: &Connection, text: &str, opts: &ParseOptions) -> Result<Preview> {
    let batch = matrix::parse_matrix(text, opts)?;
    let existing = load_existing(conn, &batch.candidates)?;
    let reconciliation = reconcile::detect_conflicts(&batch.candidates, &existing);
    let token = reconcile::fingerprint(&batch.candidates, &existing);
    let mappings = group_mappings(
        conn,
        distinct_identities(&batch.candidates).iter().map(String::as_str),
    )?;
    let records = batch
        .candidates
        .iter()
        .map(|c| LegacyAttendanceRecord {
            id: None,
            legacy_identity: c.key.legacy_identity.clone(),
            event_date: c.key.event_date,
            status: c.status,
            mapped_user_id: mappings.get(&c.key.legacy_identity).copied(),
            created_at: None,
            updated_at: None,
        })
        .collect();
    Ok(Preview {
        batch,
        reconciliation,
        records,
        token,
    })
}

pub fn commit(
    conn: &Connection,
    text: &str,
    opts: &ParseOptions,
    resolutions: &[Resolution],
    preview_token: Option<&str>,
) -> Result<CommitOutcome> {
    let batch = matrix::parse_matrix(text, opts)?;

    let tx = db::begin_immediate(conn)?;
    let existing = load_existing(&tx, &batch.candidates)?;
    let reconciliation = reconcile::detect_conflicts(&batch.candidates, &existing);
    let live_token = reconcile::fingerprint(&batch.candidates, &existing);
    let plan = match reconcile::plan_commit(
        &reconciliation,
        &existing,
        resolutions,
        preview_token,
        &live_token,
    ) {
        Ok(p) => p,
        Err(e) => {
            warn!(
                code = e.code(),
                conflicts = reconciliation.conflicts.len(),
                resolutions = resolutions.len(),
                "legacy attendance commit rejected"
            );
            return Err(e);
        }
    };

    // New rows join their group's mapping so no group is left half-mapped.
    let mappings = group_mappings(
        &tx,
        distinct_identities(&plan.inserts).iter().map(String::as_str),
    )?;
    let now = Utc::now().to_rfc3339();

    {
        let mut insert = tx.prepare(
            "INSERT INTO legacy_attendance(id, legacy_identity, event_date, status, is_mapped, mapped_user_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
        )?;
        for c in &plan.inserts {
            let mapped = mappings.get(&c.key.legacy_identity).copied();
            insert.execute((
                Uuid::new_v4().to_string(),
                &c.key.legacy_identity,
                c.key.event_date,
                c.status,
                mapped.is_some(),
                mapped,
                &now,
            ))?;
        }

        let mut update = tx.prepare(
            "UPDATE legacy_attendance SET status = ?, updated_at = ?
             WHERE legacy_identity = ? AND event_date = ?",
        )?;
        for (key, status) in &plan.updates {
            let changed = update.execute((status, &now, &key.legacy_identity, key.event_date))?;
            if changed != 1 {
                return Err(ImportError::AbortedStaleConflict {
                    keys: vec![key.clone()],
                    evidence: StaleEvidence::ExistingStatus,
                });
            }
        }
    }
    tx.commit()?;

    let outcome = CommitOutcome {
        inserted: plan.inserts.len(),
        updated: plan.updates.len(),
        kept_existing: plan.kept_existing,
        satisfied: plan.satisfied,
    };
    info!(
        inserted = outcome.inserted,
        updated = outcome.updated,
        kept_existing = outcome.kept_existing,
        satisfied = outcome.satisfied,
        "legacy attendance batch committed"
    );
    Ok(outcome)
}

fn distinct_identities(candidates: &[Candidate]) -> Vec<String> {
    let set: BTreeSet<&str> = candidates
        .iter()
        .map(|c| c.key.legacy_identity.as_str())
        .collect();
    set.into_iter().map(str::to_string).collect()
}
