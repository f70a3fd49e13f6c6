use crate::matrix::RecordKey;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no YEAR: marker followed by a four-digit year")]
    MissingYearMarker,
    #[error("no date columns (expected labels like 26-Dec) after the YEAR: marker")]
    NoDateColumns,
    #[error("header has no identity column before the first date column")]
    NoIdentityColumn,
    #[error("date column {label} is not a valid date in {year}")]
    InvalidDate { label: String, year: i32 },
    #[error("paste has {cells} cells, limit is {limit}")]
    TooLarge { cells: usize, limit: usize },
}

/// Which part of the commit request exposed a stale preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleEvidence {
    PreviewToken,
    ExistingStatus,
}

impl StaleEvidence {
    pub fn as_str(self) -> &'static str {
        match self {
            StaleEvidence::PreviewToken => "previewToken",
            StaleEvidence::ExistingStatus => "existingStatus",
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("{0} not found")]
    IdentityNotFound(String),

    #[error(
        "resolutions must cover every conflict exactly and state what the preview showed ({} missing, {} extra, {} unverified)",
        missing.len(),
        extra.len(),
        unverified.len()
    )]
    IncompleteResolution {
        missing: Vec<RecordKey>,
        extra: Vec<RecordKey>,
        /// Resolutions with no `existingStatus`, sent without a preview token.
        unverified: Vec<RecordKey>,
    },

    #[error("stored attendance changed since preview for {} key(s)", keys.len())]
    AbortedStaleConflict {
        keys: Vec<RecordKey>,
        evidence: StaleEvidence,
    },

    #[error("storage failure: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Parse(_) => "parse_error",
            ImportError::IdentityNotFound(_) => "identity_not_found",
            ImportError::IncompleteResolution { .. } => "incomplete_resolution",
            ImportError::AbortedStaleConflict { .. } => "aborted_stale_conflict",
            ImportError::Persistence(_) => "persistence_error",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            ImportError::Parse(ParseError::InvalidDate { label, year }) => {
                Some(json!({ "label": label, "year": year }))
            }
            ImportError::Parse(ParseError::TooLarge { cells, limit }) => {
                Some(json!({ "cells": cells, "limit": limit }))
            }
            ImportError::Parse(_) => None,
            ImportError::IdentityNotFound(what) => Some(json!({ "target": what })),
            ImportError::IncompleteResolution {
                missing,
                extra,
                unverified,
            } => Some(json!({
                "missing": missing.iter().map(RecordKey::to_json).collect::<Vec<_>>(),
                "extra": extra.iter().map(RecordKey::to_json).collect::<Vec<_>>(),
                "unverified": unverified.iter().map(RecordKey::to_json).collect::<Vec<_>>(),
            })),
            ImportError::AbortedStaleConflict { keys, evidence } => Some(json!({
                "keys": keys.iter().map(RecordKey::to_json).collect::<Vec<_>>(),
                "reason": evidence.as_str(),
            })),
            ImportError::Persistence(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;
