use super::setup::import_settings;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, with_db};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::matrix::RecordKey;
use crate::reconcile::{Keep, Resolution};
use crate::status::Status;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::{json, Value};

fn get_text(params: &Value) -> Result<&str, HandlerErr> {
    params
        .get("text")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerErr::bad_params("missing text"))
}

fn parse_resolution(i: usize, v: &Value) -> Result<Resolution, HandlerErr> {
    let field = |k: &str| {
        v.get(k)
            .and_then(|x| x.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("resolutions[{i}].{k} must be string")))
    };
    let legacy_identity = field("legacyIdentity")?;
    let date_raw = field("eventDate")?;
    let event_date = NaiveDate::parse_from_str(date_raw.trim(), "%Y-%m-%d").map_err(|_| {
        HandlerErr::bad_params(format!("resolutions[{i}].eventDate must be YYYY-MM-DD"))
    })?;
    let keep = Keep::parse(field("keep")?).ok_or_else(|| {
        HandlerErr::bad_params(format!(
            "resolutions[{i}].keep must be one of: existing, proposed"
        ))
    })?;
    let observed_existing = match v.get("existingStatus") {
        None => None,
        Some(x) if x.is_null() => None,
        Some(x) => Some(x.as_str().and_then(Status::parse).ok_or_else(|| {
            HandlerErr::bad_params(format!(
                "resolutions[{i}].existingStatus must be one of: present, absent, noted_absence"
            ))
        })?),
    };
    Ok(Resolution {
        key: RecordKey::new(legacy_identity, event_date),
        keep,
        observed_existing,
    })
}

fn parse_resolutions(params: &Value) -> Result<Vec<Resolution>, HandlerErr> {
    match params.get("resolutions") {
        None => Ok(Vec::new()),
        Some(v) if v.is_null() => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| parse_resolution(i, v))
            .collect(),
        Some(_) => Err(HandlerErr::bad_params("resolutions must be an array")),
    }
}

fn legacy_preview(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let text = get_text(params)?;
    let settings = import_settings(conn);
    let preview = ledger::preview(conn, text, &settings.parse_options())?;
    Ok(preview.to_json())
}

fn legacy_commit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let text = get_text(params)?;
    let resolutions = parse_resolutions(params)?;
    let preview_token = get_optional_str(params, "previewToken")?;
    let settings = import_settings(conn);
    let outcome = ledger::commit(
        conn,
        text,
        &settings.parse_options(),
        &resolutions,
        preview_token.as_deref(),
    )?;
    Ok(outcome.to_json())
}

fn legacy_import(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let preview_only = match params.get("previewOnly") {
        None => true,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("previewOnly must be boolean"))?,
    };
    let mut result = if preview_only {
        legacy_preview(conn, params)?
    } else {
        legacy_commit(conn, params)?
    };
    result["previewOnly"] = json!(preview_only);
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "legacyAttendance.previewImport" => Some(with_db(state, req, legacy_preview)),
        "legacyAttendance.applyImport" => Some(with_db(state, req, legacy_commit)),
        "legacyAttendance.import" => Some(with_db(state, req, legacy_import)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_carries_keep_and_optional_status() {
        let r = parse_resolution(
            0,
            &json!({
                "legacyIdentity": "Smith",
                "eventDate": "2026-01-02",
                "keep": "proposed",
                "existingStatus": "present"
            }),
        )
        .unwrap_or_else(|e| panic!("{}", e.message));
        assert_eq!(r.keep, Keep::Proposed);
        assert_eq!(r.observed_existing, Some(Status::Present));
        assert_eq!(r.key.legacy_identity, "Smith");

        let r = parse_resolution(
            1,
            &json!({ "legacyIdentity": "Smith", "eventDate": "2026-01-02", "keep": "existing" }),
        )
        .unwrap_or_else(|e| panic!("{}", e.message));
        assert_eq!(r.observed_existing, None);
    }

    #[test]
    fn malformed_resolutions_are_bad_params() {
        for bad in [
            json!({ "resolutions": {} }),
            json!({ "resolutions": [{ "legacyIdentity": "Smith", "eventDate": "02/01/2026", "keep": "existing" }] }),
            json!({ "resolutions": [{ "legacyIdentity": "Smith", "eventDate": "2026-01-02", "keep": "both" }] }),
            json!({ "resolutions": [{ "legacyIdentity": "Smith", "eventDate": "2026-01-02", "choice": "proposed" }] }),
            json!({ "resolutions": [{ "legacyIdentity": "Smith", "eventDate": "2026-01-02", "keep": "existing", "existingStatus": "late" }] }),
        ] {
            let e = parse_resolutions(&bad).err().expect("bad params");
            assert_eq!(e.code, "bad_params");
        }
        assert!(parse_resolutions(&json!({})).map(|r| r.is_empty()).unwrap_or(false));
    }
}
