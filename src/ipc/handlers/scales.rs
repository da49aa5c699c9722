use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, default_scale, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scale::{self, ScaleEntry};
use serde_json::json;

fn parse_entries(req: &Request) -> Result<Vec<ScaleEntry>, serde_json::Value> {
    let Some(arr) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "missing entries[]", None));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, raw) in arr.iter().enumerate() {
        let letter = raw.get("letter").and_then(|v| v.as_str());
        let min_percentage = raw.get("minPercentage").and_then(|v| v.as_f64());
        let gpa_points = raw.get("gpaPoints").and_then(|v| v.as_f64());
        let (Some(letter), Some(min_percentage), Some(gpa_points)) =
            (letter, min_percentage, gpa_points)
        else {
            return Err(err(
                &req.id,
                "bad_params",
                format!(
                    "entry at index {} needs letter, minPercentage and gpaPoints",
                    i
                ),
                Some(json!({ "index": i })),
            ));
        };
        out.push(ScaleEntry {
            letter: letter.trim().to_string(),
            min_percentage,
            gpa_points,
        });
    }
    Ok(out)
}

fn handle_scales_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let entries = match parse_entries(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let make_default = req
        .params
        .get("makeDefault")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    match scale::create_scale(conn, &name, entries, make_default) {
        Ok(s) => ok(&req.id, json!({ "scale": s })),
        Err(e) => calc_err(req, e),
    }
}

fn handle_scales_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match scale::list_scales(conn) {
        Ok(scales) => {
            let default_scale_id = scales.iter().find(|s| s.is_default).map(|s| s.id.clone());
            ok(
                &req.id,
                json!({ "scales": scales, "defaultScaleId": default_scale_id }),
            )
        }
        Err(e) => calc_err(req, e),
    }
}

fn handle_scales_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale_id = match required_str(req, "scaleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match scale::load_scale(conn, &scale_id) {
        Ok(Some(s)) => ok(&req.id, json!({ "scale": s })),
        Ok(None) => err(&req.id, "not_found", "grading scale not found", None),
        Err(e) => calc_err(req, e),
    }
}

fn handle_scales_set_default(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale_id = match required_str(req, "scaleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = scale::set_default(conn, &scale_id) {
        return calc_err(req, e);
    }
    let default_count = match scale::count_default_scales(conn) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    ok(
        &req.id,
        json!({
            "defaultScaleId": scale_id,
            "defaultCount": default_count,
            "recomputed": false
        }),
    )
}

/// Resolves a percentage to letter/points and/or a letter to points, against the
/// named scale or the current default.
fn handle_scales_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let target = match optional_str(req, "scaleId") {
        Some(id) => match scale::load_scale(conn, &id) {
            Ok(Some(s)) => s,
            Ok(None) => return err(&req.id, "not_found", "grading scale not found", None),
            Err(e) => return calc_err(req, e),
        },
        None => match default_scale(conn, req) {
            Ok(Some(s)) => s,
            Ok(None) => {
                return err(
                    &req.id,
                    "not_found",
                    "no default grading scale",
                    Some(json!({ "reason": "no_default_scale" })),
                )
            }
            Err(e) => return e,
        },
    };

    let percentage = req.params.get("percentage").and_then(|v| v.as_f64());
    let letter = optional_str(req, "letter");
    if percentage.is_none() && letter.is_none() {
        return err(
            &req.id,
            "bad_params",
            "provide percentage and/or letter",
            None,
        );
    }

    let mut result = json!({ "scaleId": target.id });
    if let Some(p) = percentage {
        let resolved = target.resolve(p);
        result["percentage"] = json!(p);
        result["letter"] = json!(resolved.as_ref().map(|r| r.letter.clone()));
        result["gpaPoints"] = json!(resolved.as_ref().map(|r| r.gpa_points));
    }
    if let Some(l) = letter {
        let mapped = target.lookup_points(&l).is_some();
        result["lookupLetter"] = json!(l);
        result["lookupPoints"] = json!(target.points_for(&l));
        result["mapped"] = json!(mapped);
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scales.create" => Some(handle_scales_create(state, req)),
        "scales.list" => Some(handle_scales_list(state, req)),
        "scales.get" => Some(handle_scales_get(state, req)),
        "scales.setDefault" => Some(handle_scales_set_default(state, req)),
        "scales.resolve" => Some(handle_scales_resolve(state, req)),
        _ => None,
    }
}
