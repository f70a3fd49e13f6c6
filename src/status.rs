use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::fmt;

/// Tokens that appear in legacy sheets but carry no attendance fact.
pub const SKIP_TOKENS: [&str; 3] = ["LOA", "NO", "EO"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    Present,
    Absent,
    NotedAbsence,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Present => "present",
            Status::Absent => "absent",
            Status::NotedAbsence => "noted_absence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Status::Present),
            "absent" => Some(Status::Absent),
            "noted_absence" => Some(Status::NotedAbsence),
            _ => None,
        }
    }

    /// Maps a sheet token (already trimmed and uppercased) to a canonical status.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "P" => Some(Status::Present),
            "A" => Some(Status::Absent),
            "NA" => Some(Status::NotedAbsence),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Status::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown status {s:?}").into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Leave, no-show or early-out markers.
    Excused(String),
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Skipped(SkipReason),
    Attendance(Status),
}

pub fn classify_cell(raw: &str) -> Cell {
    let token = raw.trim().to_ascii_uppercase();
    if token.is_empty() {
        return Cell::Empty;
    }
    if SKIP_TOKENS.contains(&token.as_str()) {
        return Cell::Skipped(SkipReason::Excused(token));
    }
    match Status::from_token(&token) {
        Some(status) => Cell::Attendance(status),
        None => Cell::Skipped(SkipReason::Unrecognized(token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_tokens_map_to_statuses() {
        assert_eq!(classify_cell("P"), Cell::Attendance(Status::Present));
        assert_eq!(classify_cell(" a "), Cell::Attendance(Status::Absent));
        assert_eq!(classify_cell("na"), Cell::Attendance(Status::NotedAbsence));
    }

    #[test]
    fn skip_set_and_blanks_are_not_attendance() {
        assert_eq!(classify_cell(""), Cell::Empty);
        assert_eq!(classify_cell("   "), Cell::Empty);
        for t in ["LOA", "loa", "No", "EO"] {
            assert!(matches!(
                classify_cell(t),
                Cell::Skipped(SkipReason::Excused(_))
            ));
        }
    }

    #[test]
    fn unknown_tokens_are_skipped_not_errors() {
        assert_eq!(
            classify_cell("x"),
            Cell::Skipped(SkipReason::Unrecognized("X".to_string()))
        );
        assert!(matches!(
            classify_cell("PRESENT"),
            Cell::Skipped(SkipReason::Unrecognized(_))
        ));
    }

    #[test]
    fn storage_form_roundtrips() {
        for s in [Status::Present, Status::Absent, Status::NotedAbsence] {
            assert_eq!(Status::parse(s.as_str()), Some(s));
        }
        assert_eq!(Status::parse("late"), None);
    }
}
