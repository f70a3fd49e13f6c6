use crate::accounts::DEFAULT_SEARCH_LIMIT;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::matrix::{ParseOptions, DEFAULT_MAX_CELLS};
use serde_json::{json, Map, Value};
use tracing::warn;

#[derive(Clone, Copy)]
enum SetupSection {
    LegacyImport,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "legacyImport" => Some(Self::LegacyImport),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::LegacyImport => "setup.legacyImport",
        }
    }
}

/// Tunables for the import pipeline, resolved from the workspace settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSettings {
    pub max_cells: usize,
    pub search_limit: usize,
}

impl ImportSettings {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            max_cells: self.max_cells,
        }
    }
}

pub fn import_settings(conn: &rusqlite::Connection) -> ImportSettings {
    let section = match load_section(conn, SetupSection::LegacyImport) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "legacy import settings unreadable, using defaults");
            default_section(SetupSection::LegacyImport)
        }
    };
    let field = |k: &str, default: usize| {
        section
            .get(k)
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(default)
    };
    ImportSettings {
        max_cells: field("maxCells", DEFAULT_MAX_CELLS),
        search_limit: field("searchLimit", DEFAULT_SEARCH_LIMIT),
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::LegacyImport => json!({
            "maxCells": DEFAULT_MAX_CELLS,
            "searchLimit": DEFAULT_SEARCH_LIMIT
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::LegacyImport => match k.as_str() {
                "maxCells" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1_000, 5_000_000)?));
                }
                "searchLimit" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 200)?));
                }
                _ => return Err(format!("unknown legacyImport field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    section: SetupSection,
) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        let Some(saved_obj) = saved.as_object() else {
            warn!(key = section.key(), "saved setup section is not an object, using defaults");
            return Ok(current);
        };
        let mut merged = current.clone();
        match merge_section_patch(section, &mut merged, saved_obj) {
            Ok(()) => current = merged,
            Err(msg) => {
                warn!(key = section.key(), error = %msg, "saved setup section invalid, using defaults")
            }
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match req.params.get("section") {
        None => {}
        Some(v) if v.is_null() => {}
        Some(v) => {
            if v.as_str().and_then(SetupSection::parse).is_none() {
                return err(&req.id, "bad_params", "unknown section", None);
            }
        }
    }
    let legacy_import = match load_section(conn, SetupSection::LegacyImport) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "legacyImport": legacy_import }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "section": section_raw, "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
