use crate::error::{ImportError, StaleEvidence};
use crate::matrix::{Candidate, RecordKey};
use crate::status::Status;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

/// Stored status per key, as read from the ledger.
pub type ExistingState = HashMap<RecordKey, Status>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub key: RecordKey,
    pub existing_status: Status,
    pub proposed_status: Status,
}

impl ConflictEntry {
    pub fn to_json(&self) -> Value {
        json!({
            "legacyIdentity": self.key.legacy_identity,
            "eventDate": self.key.event_date.to_string(),
            "existingStatus": self.existing_status.as_str(),
            "proposedStatus": self.proposed_status.as_str(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Keys with no stored row.
    pub new: Vec<Candidate>,
    /// Keys already stored with the same status.
    pub satisfied: Vec<Candidate>,
    pub conflicts: Vec<ConflictEntry>,
}

/// Sorts candidates against stored state. Read-only.
pub fn detect_conflicts(candidates: &[Candidate], existing: &ExistingState) -> Reconciliation {
    let mut out = Reconciliation::default();
    for c in candidates {
        match existing.get(&c.key) {
            None => out.new.push(c.clone()),
            Some(s) if *s == c.status => out.satisfied.push(c.clone()),
            Some(s) => out.conflicts.push(ConflictEntry {
                key: c.key.clone(),
                existing_status: *s,
                proposed_status: c.status,
            }),
        }
    }
    out
}

/// Digest of the stored state behind every candidate key. A commit whose live
/// fingerprint differs from the preview's saw a different store.
pub fn fingerprint(candidates: &[Candidate], existing: &ExistingState) -> String {
    let keys: BTreeSet<&RecordKey> = candidates.iter().map(|c| &c.key).collect();
    let mut hasher = Sha256::new();
    for k in keys {
        let stored = existing.get(k).map(|s| s.as_str()).unwrap_or("-");
        hasher.update(k.legacy_identity.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(k.event_date.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(stored.as_bytes());
        hasher.update(b"\x1e");
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    Existing,
    Proposed,
}

impl Keep {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "existing" => Some(Keep::Existing),
            "proposed" => Some(Keep::Proposed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: RecordKey,
    pub keep: Keep,
    /// Stored status the operator saw when resolving, if they sent it back.
    pub observed_existing: Option<Status>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPlan {
    pub inserts: Vec<Candidate>,
    pub updates: Vec<(RecordKey, Status)>,
    pub kept_existing: usize,
    pub satisfied: usize,
}

/// Checks resolutions against the live reconciliation and turns them into
/// writes.
///
/// Every resolution must carry evidence of what the preview showed: either
/// its own `observed_existing` or a preview token for the whole batch.
/// Staleness is checked before coverage so an operator working from an old
/// preview is told to re-preview rather than to resolve keys they never saw.
pub fn plan_commit(
    rec: &Reconciliation,
    existing: &ExistingState,
    resolutions: &[Resolution],
    preview_token: Option<&str>,
    live_token: &str,
) -> Result<CommitPlan, ImportError> {
    if preview_token.is_none() {
        let unverified: BTreeSet<RecordKey> = resolutions
            .iter()
            .filter(|r| r.observed_existing.is_none())
            .map(|r| r.key.clone())
            .collect();
        if !unverified.is_empty() {
            return Err(ImportError::IncompleteResolution {
                missing: Vec::new(),
                extra: Vec::new(),
                unverified: unverified.into_iter().collect(),
            });
        }
    }

    // Keys with no stored row cannot have been seen as conflicts; coverage
    // reports them as extra.
    let moved: BTreeSet<RecordKey> = resolutions
        .iter()
        .filter_map(|r| {
            let observed = r.observed_existing?;
            let live = existing.get(&r.key)?;
            (*live != observed).then(|| r.key.clone())
        })
        .collect();
    if !moved.is_empty() {
        return Err(ImportError::AbortedStaleConflict {
            keys: moved.into_iter().collect(),
            evidence: StaleEvidence::ExistingStatus,
        });
    }
    if preview_token.is_some_and(|t| t != live_token) {
        // Records are never deleted, so whatever changed is a candidate key
        // that now has a stored row.
        let stored: BTreeSet<RecordKey> = rec
            .conflicts
            .iter()
            .map(|c| c.key.clone())
            .chain(rec.satisfied.iter().map(|c| c.key.clone()))
            .collect();
        return Err(ImportError::AbortedStaleConflict {
            keys: stored.into_iter().collect(),
            evidence: StaleEvidence::PreviewToken,
        });
    }

    let conflict_keys: BTreeSet<&RecordKey> = rec.conflicts.iter().map(|c| &c.key).collect();
    let mut by_key: HashMap<&RecordKey, &Resolution> = HashMap::new();
    let mut extra: BTreeSet<RecordKey> = BTreeSet::new();
    for r in resolutions {
        if !conflict_keys.contains(&r.key) || by_key.insert(&r.key, r).is_some() {
            extra.insert(r.key.clone());
        }
    }
    let missing: Vec<RecordKey> = conflict_keys
        .iter()
        .filter(|k| !by_key.contains_key(*k))
        .map(|k| (*k).clone())
        .collect();
    if !missing.is_empty() || !extra.is_empty() {
        return Err(ImportError::IncompleteResolution {
            missing,
            extra: extra.into_iter().collect(),
            unverified: Vec::new(),
        });
    }

    let mut plan = CommitPlan {
        inserts: rec.new.clone(),
        satisfied: rec.satisfied.len(),
        ..CommitPlan::default()
    };
    for c in &rec.conflicts {
        match by_key.get(&c.key).map(|r| r.keep) {
            Some(Keep::Proposed) => plan.updates.push((c.key.clone(), c.proposed_status)),
            Some(Keep::Existing) | None => plan.kept_existing += 1,
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn key(name: &str, m: u32, d: u32) -> RecordKey {
        RecordKey::new(name, NaiveDate::from_ymd_opt(2026, m, d).expect("date"))
    }

    fn cand(name: &str, m: u32, d: u32, status: Status) -> Candidate {
        Candidate {
            key: key(name, m, d),
            status,
        }
    }

    fn smith_conflict() -> (Vec<Candidate>, ExistingState) {
        let candidates = vec![
            cand("Smith", 1, 2, Status::Absent),
            cand("Smith", 1, 9, Status::Present),
            cand("Jones", 1, 2, Status::Present),
        ];
        let mut existing = ExistingState::new();
        existing.insert(key("Smith", 1, 2), Status::Present);
        existing.insert(key("Jones", 1, 2), Status::Present);
        (candidates, existing)
    }

    #[test]
    fn divergent_status_is_a_conflict() {
        let (candidates, existing) = smith_conflict();
        let rec = detect_conflicts(&candidates, &existing);
        assert_eq!(
            rec.conflicts,
            vec![ConflictEntry {
                key: key("Smith", 1, 2),
                existing_status: Status::Present,
                proposed_status: Status::Absent,
            }]
        );
        assert_eq!(rec.new, vec![cand("Smith", 1, 9, Status::Present)]);
        assert_eq!(rec.satisfied, vec![cand("Jones", 1, 2, Status::Present)]);
        assert_eq!(
            rec.conflicts[0].to_json(),
            json!({
                "legacyIdentity": "Smith",
                "eventDate": "2026-01-02",
                "existingStatus": "present",
                "proposedStatus": "absent"
            })
        );
    }

    #[test]
    fn detection_is_repeatable() {
        let (candidates, existing) = smith_conflict();
        assert_eq!(
            detect_conflicts(&candidates, &existing),
            detect_conflicts(&candidates, &existing)
        );
        assert_eq!(
            fingerprint(&candidates, &existing),
            fingerprint(&candidates, &existing)
        );
    }

    #[test]
    fn fingerprint_tracks_stored_state_of_candidate_keys_only() {
        let (candidates, mut existing) = smith_conflict();
        let before = fingerprint(&candidates, &existing);
        existing.insert(key("Other", 3, 3), Status::Absent);
        assert_eq!(fingerprint(&candidates, &existing), before);
        existing.insert(key("Smith", 1, 9), Status::Absent);
        assert_ne!(fingerprint(&candidates, &existing), before);
    }

    #[test]
    fn empty_resolutions_with_conflict_is_incomplete() {
        let (candidates, existing) = smith_conflict();
        let rec = detect_conflicts(&candidates, &existing);
        let token = fingerprint(&candidates, &existing);
        let err = plan_commit(&rec, &existing, &[], None, &token).expect_err("incomplete");
        match err {
            ImportError::IncompleteResolution {
                missing,
                extra,
                unverified,
            } => {
                assert_eq!(missing, vec![key("Smith", 1, 2)]);
                assert!(extra.is_empty());
                assert!(unverified.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn extra_and_duplicate_resolutions_are_incomplete() {
        let (candidates, existing) = smith_conflict();
        let rec = detect_conflicts(&candidates, &existing);
        let token = fingerprint(&candidates, &existing);
        let r = |k: RecordKey| Resolution {
            key: k,
            keep: Keep::Proposed,
            observed_existing: Some(Status::Present),
        };

        let err = plan_commit(
            &rec,
            &existing,
            &[r(key("Smith", 1, 2)), r(key("Jones", 1, 2))],
            None,
            &token,
        )
        .expect_err("extra");
        assert!(matches!(err, ImportError::IncompleteResolution { ref extra, .. } if extra == &vec![key("Jones", 1, 2)]));

        let err = plan_commit(
            &rec,
            &existing,
            &[r(key("Smith", 1, 2)), r(key("Smith", 1, 2))],
            None,
            &token,
        )
        .expect_err("duplicate");
        assert!(matches!(err, ImportError::IncompleteResolution { .. }));
    }

    #[test]
    fn exact_resolutions_produce_updates_and_inserts() {
        let (candidates, existing) = smith_conflict();
        let rec = detect_conflicts(&candidates, &existing);
        let token = fingerprint(&candidates, &existing);
        let plan = plan_commit(
            &rec,
            &existing,
            &[Resolution {
                key: key("Smith", 1, 2),
                keep: Keep::Proposed,
                observed_existing: Some(Status::Present),
            }],
            Some(&token),
            &token,
        )
        .expect("plan");
        assert_eq!(plan.updates, vec![(key("Smith", 1, 2), Status::Absent)]);
        assert_eq!(plan.inserts, vec![cand("Smith", 1, 9, Status::Present)]);
        assert_eq!(plan.kept_existing, 0);
        assert_eq!(plan.satisfied, 1);

        let plan = plan_commit(
            &rec,
            &existing,
            &[Resolution {
                key: key("Smith", 1, 2),
                keep: Keep::Existing,
                observed_existing: None,
            }],
            Some(&token),
            &token,
        )
        .expect("plan keep existing");
        assert!(plan.updates.is_empty());
        assert_eq!(plan.kept_existing, 1);
    }

    #[test]
    fn changed_store_aborts_as_stale() {
        let (candidates, existing) = smith_conflict();
        let preview_token = fingerprint(&candidates, &existing);

        let mut live = existing.clone();
        live.insert(key("Smith", 1, 2), Status::NotedAbsence);
        let rec = detect_conflicts(&candidates, &live);
        let live_token = fingerprint(&candidates, &live);
        let resolution = Resolution {
            key: key("Smith", 1, 2),
            keep: Keep::Proposed,
            observed_existing: Some(Status::Present),
        };

        let err = plan_commit(&rec, &live, &[resolution.clone()], None, &live_token)
            .expect_err("stale by observed status");
        assert!(matches!(
            err,
            ImportError::AbortedStaleConflict { ref keys, evidence: StaleEvidence::ExistingStatus }
                if keys == &vec![key("Smith", 1, 2)]
        ));

        let bare = Resolution {
            observed_existing: None,
            ..resolution
        };
        let err = plan_commit(&rec, &live, &[bare.clone()], Some(&preview_token), &live_token)
            .expect_err("stale by token");
        assert!(matches!(
            err,
            ImportError::AbortedStaleConflict { evidence: StaleEvidence::PreviewToken, .. }
        ));

        let err = plan_commit(&rec, &live, &[bare], None, &live_token)
            .expect_err("no evidence at all");
        assert!(matches!(
            err,
            ImportError::IncompleteResolution { ref unverified, .. }
                if unverified == &vec![key("Smith", 1, 2)]
        ));
    }

    #[test]
    fn token_mismatch_on_settled_key_names_that_key() {
        let candidates = vec![cand("Lee", 2, 1, Status::Absent), cand("Lee", 2, 8, Status::Present)];
        let preview_token = fingerprint(&candidates, &ExistingState::new());
        let mut live = ExistingState::new();
        live.insert(key("Lee", 2, 1), Status::Absent);
        let rec = detect_conflicts(&candidates, &live);
        assert!(rec.conflicts.is_empty());
        let live_token = fingerprint(&candidates, &live);
        let err = plan_commit(&rec, &live, &[], Some(&preview_token), &live_token)
            .expect_err("stale");
        assert_eq!(err.code(), "aborted_stale_conflict");
        assert_eq!(
            err.details(),
            Some(json!({
                "keys": [{ "legacyIdentity": "Lee", "eventDate": "2026-02-01" }],
                "reason": "previewToken"
            }))
        );
    }

    #[test]
    fn new_conflict_since_preview_is_stale_when_token_sent() {
        let candidates = vec![cand("Lee", 2, 1, Status::Present)];
        let preview_token = fingerprint(&candidates, &ExistingState::new());
        let mut live = ExistingState::new();
        live.insert(key("Lee", 2, 1), Status::Absent);
        let rec = detect_conflicts(&candidates, &live);
        let live_token = fingerprint(&candidates, &live);
        let err = plan_commit(&rec, &live, &[], Some(&preview_token), &live_token)
            .expect_err("stale");
        assert!(matches!(err, ImportError::AbortedStaleConflict { ref keys, .. } if keys == &vec![key("Lee", 2, 1)]));
    }

    #[test]
    fn keep_accepts_only_existing_or_proposed() {
        assert_eq!(Keep::parse("proposed"), Some(Keep::Proposed));
        assert_eq!(Keep::parse(" Existing "), Some(Keep::Existing));
        assert_eq!(Keep::parse("new"), None);
        assert_eq!(Keep::parse("old"), None);
        assert_eq!(Keep::parse("both"), None);
    }
}
