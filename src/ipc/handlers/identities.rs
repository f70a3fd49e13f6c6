use crate::identity;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_required_i64, get_required_raw_str, with_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

fn identities_list_groups(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let groups = identity::list_groups(conn)?;
    let mapped = groups
        .iter()
        .filter(|g| g.state() == identity::MappingState::Mapped)
        .count();
    Ok(json!({
        "groups": groups.iter().map(|g| g.to_json()).collect::<Vec<_>>(),
        "totalGroups": groups.len(),
        "mappedGroups": mapped,
    }))
}

fn identities_map(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let legacy_identity = get_required_raw_str(params, "legacyIdentity")?;
    let user_id = get_required_i64(params, "canonicalUserId")?;
    let updated = identity::propose_mapping(conn, &legacy_identity, user_id)?;
    Ok(json!({
        "legacyIdentity": legacy_identity,
        "mappedUserId": user_id,
        "isMapped": true,
        "updated": updated,
    }))
}

fn identities_unmap(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let legacy_identity = get_required_raw_str(params, "legacyIdentity")?;
    let updated = identity::clear_mapping(conn, &legacy_identity)?;
    Ok(json!({
        "legacyIdentity": legacy_identity,
        "isMapped": false,
        "updated": updated,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "identities.listGroups" => Some(with_db(state, req, identities_list_groups)),
        "identities.map" => Some(with_db(state, req, identities_map)),
        "identities.unmap" => Some(with_db(state, req, identities_unmap)),
        _ => None,
    }
}
