use crate::calc::{self, RecomputeScope};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, default_scale, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_enrollments_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale = match default_scale(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match calc::load_cached_grade(conn, &enrollment_id, scale.as_ref().map(|s| s.id.as_str())) {
        Ok(Some(cached)) => ok(&req.id, json!({ "enrollment": cached })),
        Ok(None) => err(&req.id, "not_found", "enrollment not found", None),
        Err(e) => calc_err(req, e),
    }
}

fn handle_enrollments_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale = match default_scale(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match calc::recompute_enrollment(conn, &enrollment_id, scale.as_ref()) {
        Ok(outcome) => ok(&req.id, json!({ "enrollment": outcome })),
        Err(e) => calc_err(req, e),
    }
}

/// Administrative refresh of cached grades, e.g. after the default scale changed.
fn handle_enrollments_recompute_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match (optional_str(req, "courseOfferingId"), optional_str(req, "termId")) {
        (Some(_), Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "pass at most one of courseOfferingId, termId",
                None,
            )
        }
        (Some(o), None) => RecomputeScope::CourseOffering(o),
        (None, Some(t)) => RecomputeScope::Term(t),
        (None, None) => RecomputeScope::All,
    };
    let scale = match default_scale(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ids = match calc::enrollment_ids_in_scope(conn, &scope) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let outcomes = match calc::recompute_distinct(&tx, ids.iter().map(String::as_str), scale.as_ref())
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return calc_err(req, e);
        }
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let unresolved = outcomes
        .iter()
        .filter(|o| o.grade.grade_status == calc::GradeStatus::NoDefaultScale)
        .count();
    tracing::info!(
        scope = ?scope,
        recomputed = outcomes.len(),
        unresolved,
        scale_id = ?scale.as_ref().map(|s| s.id.as_str()),
        "bulk enrollment recompute finished"
    );
    ok(
        &req.id,
        json!({
            "ok": true,
            "recomputed": outcomes.len(),
            "unresolved": unresolved,
            "scaleId": scale.as_ref().map(|s| s.id.clone()),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.get" => Some(handle_enrollments_get(state, req)),
        "enrollments.recompute" => Some(handle_enrollments_recompute(state, req)),
        "enrollments.recomputeAll" => Some(handle_enrollments_recompute_all(state, req)),
        _ => None,
    }
}
