use crate::calc::CalcError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, DroppedPolicy};
use crate::scale::{self, GradingScale};
use rusqlite::Connection;
use serde_json::json;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn calc_err(req: &Request, e: CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

pub fn default_scale(
    conn: &Connection,
    req: &Request,
) -> Result<Option<GradingScale>, serde_json::Value> {
    scale::load_default_scale(conn).map_err(|e| calc_err(req, e))
}

/// Per-request `droppedPolicy` wins over the workspace setting.
pub fn dropped_policy(conn: &Connection, req: &Request) -> Result<DroppedPolicy, serde_json::Value> {
    match req.params.get("droppedPolicy") {
        None => Ok(rollup::load_dropped_policy(conn)),
        Some(v) if v.is_null() => Ok(rollup::load_dropped_policy(conn)),
        Some(v) => v.as_str().and_then(DroppedPolicy::parse).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                "droppedPolicy must be one of: exclude, include_graded",
                Some(json!({ "droppedPolicy": v })),
            )
        }),
    }
}
