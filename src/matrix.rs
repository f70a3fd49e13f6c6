use crate::error::ParseError;
use crate::status::{classify_cell, Cell, SkipReason, Status};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_MAX_CELLS: usize = 250_000;

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub legacy_identity: String,
    pub event_date: NaiveDate,
}

impl RecordKey {
    pub fn new(legacy_identity: impl Into<String>, event_date: NaiveDate) -> Self {
        Self {
            legacy_identity: legacy_identity.into(),
            event_date,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "legacyIdentity": self.legacy_identity,
            "eventDate": self.event_date.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: RecordKey,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBatch {
    pub candidates: Vec<Candidate>,
    pub dates: Vec<NaiveDate>,
    pub processed_cells: usize,
    pub skipped_cells: usize,
    /// Recognized cells superseded by a later row for the same identity and date.
    pub duplicate_cells: usize,
    /// Skip-set tokens seen, with counts.
    pub excused_tokens: BTreeMap<String, usize>,
    /// Non-blank tokens that are neither attendance nor skip-set, with counts.
    pub unrecognized_tokens: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub max_cells: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_cells: DEFAULT_MAX_CELLS,
        }
    }
}

struct Header {
    line_idx: usize,
    delimiter: char,
    identity_col: usize,
    first_date_col: usize,
    dates: Vec<NaiveDate>,
}

pub fn parse_matrix(text: &str, opts: &ParseOptions) -> Result<ImportBatch, ParseError> {
    let lines: Vec<&str> = text.lines().collect();
    let header = find_header(&lines)?;

    let rows: Vec<&str> = lines
        .iter()
        .skip(header.line_idx + 1)
        .copied()
        .filter(|l| !l.trim().is_empty())
        .collect();
    let total_cells = rows.len().saturating_mul(header.dates.len());
    if total_cells > opts.max_cells {
        return Err(ParseError::TooLarge {
            cells: total_cells,
            limit: opts.max_cells,
        });
    }

    let mut candidates = Vec::new();
    let mut processed_cells = 0usize;
    let mut skipped_cells = 0usize;
    let mut excused_tokens = BTreeMap::new();
    let mut unrecognized_tokens = BTreeMap::new();
    for row in rows {
        let fields = split_cells(row, header.delimiter);
        let identity = fields
            .get(header.identity_col)
            .map(|s| s.trim())
            .unwrap_or("");
        for (j, date) in header.dates.iter().enumerate() {
            if identity.is_empty() {
                skipped_cells += 1;
                continue;
            }
            let raw = fields
                .get(header.first_date_col + j)
                .copied()
                .unwrap_or("");
            match classify_cell(raw) {
                Cell::Attendance(status) => {
                    processed_cells += 1;
                    candidates.push(Candidate {
                        key: RecordKey::new(identity, *date),
                        status,
                    });
                }
                Cell::Empty => skipped_cells += 1,
                Cell::Skipped(reason) => {
                    skipped_cells += 1;
                    let (tally, token) = match reason {
                        SkipReason::Excused(t) => (&mut excused_tokens, t),
                        SkipReason::Unrecognized(t) => (&mut unrecognized_tokens, t),
                    };
                    *tally.entry(token).or_insert(0usize) += 1;
                }
            }
        }
    }

    let (candidates, duplicate_cells) = collapse_duplicates(candidates);
    Ok(ImportBatch {
        candidates,
        dates: header.dates,
        processed_cells,
        skipped_cells,
        duplicate_cells,
        excused_tokens,
        unrecognized_tokens,
    })
}

fn find_header(lines: &[&str]) -> Result<Header, ParseError> {
    let (year_idx, year) = lines
        .iter()
        .enumerate()
        .find_map(|(i, l)| find_year_marker(l).map(|y| (i, y)))
        .ok_or(ParseError::MissingYearMarker)?;

    for (i, line) in lines.iter().enumerate().skip(year_idx + 1) {
        let delimiter = detect_delimiter(line);
        let fields = split_cells(line, delimiter);
        let Some(first_date_col) = fields.iter().position(|f| parse_date_label(f).is_some())
        else {
            continue;
        };
        if first_date_col == 0 {
            return Err(ParseError::NoIdentityColumn);
        }

        let labels: Vec<(&str, u32, u32)> = fields[first_date_col..]
            .iter()
            .map_while(|f| parse_date_label(f).map(|(d, m)| (f.trim(), d, m)))
            .collect();
        let months: Vec<u32> = labels.iter().map(|(_, _, m)| *m).collect();
        let years = resolve_years(year, &months);
        let mut dates = Vec::with_capacity(labels.len());
        for ((label, day, month), y) in labels.iter().zip(years) {
            let date = NaiveDate::from_ymd_opt(y, *month, *day).ok_or_else(|| {
                ParseError::InvalidDate {
                    label: label.to_string(),
                    year: y,
                }
            })?;
            dates.push(date);
        }

        let identity_col = fields[..first_date_col]
            .iter()
            .position(|f| f.trim().eq_ignore_ascii_case("name"))
            .unwrap_or(if first_date_col >= 2 { 1 } else { 0 });

        return Ok(Header {
            line_idx: i,
            delimiter,
            identity_col,
            first_date_col,
            dates,
        });
    }
    Err(ParseError::NoDateColumns)
}

/// Finds `YEAR:` followed by a four-digit year, in the same cell or the next one.
fn find_year_marker(line: &str) -> Option<i32> {
    let upper = line.to_ascii_uppercase();
    let pos = upper.find("YEAR:")?;
    let rest = line[pos + "YEAR:".len()..]
        .trim_start_matches(|c: char| c.is_whitespace() || c == ',');
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() != 4 {
        return None;
    }
    digits.parse().ok()
}

/// `26-Dec` -> (26, 12).
pub fn parse_date_label(cell: &str) -> Option<(u32, u32)> {
    let (day, month) = cell.trim().split_once('-')?;
    if day.is_empty() || day.len() > 2 || !day.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let day: u32 = day.parse().ok()?;
    if !(1..=31).contains(&day) {
        return None;
    }
    let month = month.trim().to_ascii_uppercase();
    let idx = MONTHS.iter().position(|m| *m == month)?;
    Some((day, idx as u32 + 1))
}

/// Assigns a year to each column. Sheets only state the starting year, so a
/// column whose month is earlier than the previous column's month has crossed
/// into the next year.
pub fn resolve_years(start_year: i32, months: &[u32]) -> Vec<i32> {
    let mut year = start_year;
    let mut prev: Option<u32> = None;
    months
        .iter()
        .map(|&m| {
            if let Some(p) = prev {
                if m < p {
                    year += 1;
                }
            }
            prev = Some(m);
            year
        })
        .collect()
}

/// Last row wins for repeated (identity, date) cells. The surviving candidate
/// keeps the position of the first occurrence.
pub fn collapse_duplicates(candidates: Vec<Candidate>) -> (Vec<Candidate>, usize) {
    let mut out: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut seen: HashMap<RecordKey, usize> = HashMap::new();
    let mut superseded = 0usize;
    for c in candidates {
        if let Some(&idx) = seen.get(&c.key) {
            out[idx].status = c.status;
            superseded += 1;
            continue;
        }
        seen.insert(c.key.clone(), out.len());
        out.push(c);
    }
    (out, superseded)
}

fn detect_delimiter(line: &str) -> char {
    if line.contains('\t') {
        '\t'
    } else {
        ','
    }
}

fn split_cells(line: &str, delimiter: char) -> Vec<&str> {
    line.split(delimiter).collect()
}
