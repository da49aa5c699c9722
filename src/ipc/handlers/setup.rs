use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::rollup::{DroppedPolicy, GPA_POLICY_KEY};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Gpa,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "gpa" => Some(Self::Gpa),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Gpa => GPA_POLICY_KEY,
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Gpa => json!({
            "droppedEnrollments": DroppedPolicy::default().as_str()
        }),
    }
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Gpa => match k.as_str() {
                "droppedEnrollments" => {
                    let Some(p) = v.as_str().and_then(DroppedPolicy::parse) else {
                        return Err(
                            "droppedEnrollments must be one of: exclude, include_graded"
                                .to_string(),
                        );
                    };
                    obj.insert(k.clone(), json!(p.as_str()));
                }
                _ => return Err(format!("unknown gpa field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            if let Err(msg) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(
                    key = section.key(),
                    error = %msg,
                    "malformed saved setup section; using defaults for invalid fields"
                );
            }
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let gpa = match load_section(conn, SetupSection::Gpa) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "gpa": gpa }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
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
    tracing::info!(section = section_raw, settings = %current, "setup updated");
    ok(&req.id, json!({ "ok": true, "settings": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
