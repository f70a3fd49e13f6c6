use super::setup::import_settings;
use crate::accounts;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_i64, get_optional_str, get_required_str, with_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

fn accounts_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let display_name = get_required_str(params, "displayName")?;
    let rank = get_optional_str(params, "rank")?;
    let service_no = get_optional_str(params, "serviceNo")?;
    let id = get_optional_i64(params, "id")?;
    if id.is_some_and(|v| v <= 0) {
        return Err(HandlerErr::bad_params("id must be positive"));
    }
    if let Some(v) = id {
        if accounts::account_exists(conn, v)? {
            return Err(HandlerErr {
                code: "conflict",
                message: format!("account {} already exists", v),
                details: None,
            });
        }
    }
    let account = accounts::create_account(
        conn,
        id,
        &display_name,
        rank.as_deref(),
        service_no.as_deref(),
    )?;
    Ok(json!({ "account": account.to_json() }))
}

fn accounts_search(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let query = params
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let default_limit = import_settings(conn).search_limit;
    let limit = match get_optional_i64(params, "limit")? {
        None => default_limit,
        Some(n) if (1..=200).contains(&n) => n as usize,
        Some(_) => return Err(HandlerErr::bad_params("limit must be in 1..=200")),
    };
    let found = accounts::search_accounts(conn, &query, limit)?;
    Ok(json!({
        "accounts": found.iter().map(|a| a.to_json()).collect::<Vec<_>>(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "accounts.create" => Some(with_db(state, req, accounts_create)),
        "accounts.search" => Some(with_db(state, req, accounts_search)),
        _ => None,
    }
}
