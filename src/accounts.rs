//! Canonical account directory used to pick mapping targets.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

pub const DEFAULT_SEARCH_LIMIT: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub display_name: String,
    pub rank: Option<String>,
    pub service_no: Option<String>,
    pub created_at: String,
}

impl Account {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "displayName": self.display_name,
            "rank": self.rank,
            "serviceNo": self.service_no,
            "createdAt": self.created_at,
        })
    }
}

pub fn account_exists(conn: &Connection, id: i64) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM accounts WHERE id = ?", [id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

/// Inserts an account. Without an explicit id SQLite assigns the next one.
pub fn create_account(
    conn: &Connection,
    id: Option<i64>,
    display_name: &str,
    rank: Option<&str>,
    service_no: Option<&str>,
) -> rusqlite::Result<Account> {
    let created_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO accounts(id, display_name, rank, service_no, created_at) VALUES(?, ?, ?, ?, ?)",
        (id, display_name, rank, service_no, &created_at),
    )?;
    Ok(Account {
        id: id.unwrap_or_else(|| conn.last_insert_rowid()),
        display_name: display_name.to_string(),
        rank: rank.map(str::to_string),
        service_no: service_no.map(str::to_string),
        created_at,
    })
}

/// Case-insensitive substring match over name, rank and service number.
pub fn search_accounts(conn: &Connection, query: &str, limit: usize) -> rusqlite::Result<Vec<Account>> {
    let needle = format!("%{}%", escape_like(&query.trim().to_lowercase()));
    let mut stmt = conn.prepare(
        "SELECT id, display_name, rank, service_no, created_at
         FROM accounts
         WHERE lower(display_name) LIKE ?1 ESCAPE '\\'
            OR lower(COALESCE(rank, '')) LIKE ?1 ESCAPE '\\'
            OR lower(COALESCE(service_no, '')) LIKE ?1 ESCAPE '\\'
         ORDER BY display_name, id
         LIMIT ?2",
    )?;
    let accounts = stmt
        .query_map((needle, limit as i64), |r| {
            Ok(Account {
                id: r.get(0)?,
                display_name: r.get(1)?,
                rank: r.get(2)?,
                service_no: r.get(3)?,
                created_at: r.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(accounts)
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
