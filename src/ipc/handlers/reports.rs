use crate::ipc::error::ok;
use crate::ipc::helpers::{calc_err, db_conn, default_scale, dropped_policy, required_str};
use crate::ipc::types::{AppState, Request};
use crate::transcript::{self, AssembleContext};
use serde_json::json;

fn handle_reports_report_card_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match dropped_policy(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale = match default_scale(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = AssembleContext {
        conn,
        default_scale_id: scale.as_ref().map(|s| s.id.as_str()),
        policy,
    };

    match transcript::report_card_data(&ctx, &student_id, &term_id) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => calc_err(req, e),
    }
}

fn handle_reports_transcript_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let official = req
        .params
        .get("official")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let policy = match dropped_policy(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale = match default_scale(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = AssembleContext {
        conn,
        default_scale_id: scale.as_ref().map(|s| s.id.as_str()),
        policy,
    };

    match transcript::transcript_data(&ctx, &student_id, official) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => calc_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.reportCardModel" => Some(handle_reports_report_card_model(state, req)),
        "reports.transcriptModel" => Some(handle_reports_transcript_model(state, req)),
        _ => None,
    }
}
