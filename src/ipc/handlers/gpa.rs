use crate::ipc::error::ok;
use crate::ipc::helpers::{calc_err, db_conn, dropped_policy, required_str};
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, GpaScope};
use serde_json::json;

fn handle_scoped(state: &mut AppState, req: &Request, key: &str) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope_id = match required_str(req, key) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match dropped_policy(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = if key == "termId" {
        GpaScope::Term(scope_id.clone())
    } else {
        GpaScope::Cohort(scope_id.clone())
    };
    match rollup::scoped_gpa(conn, &student_id, &scope, policy) {
        Ok(summary) => {
            let mut result = json!({ "studentId": student_id, "gpa": summary });
            result[key] = json!(scope_id);
            ok(&req.id, result)
        }
        Err(e) => calc_err(req, e),
    }
}

fn handle_gpa_term(state: &mut AppState, req: &Request) -> serde_json::Value {
    handle_scoped(state, req, "termId")
}

fn handle_gpa_cohort(state: &mut AppState, req: &Request) -> serde_json::Value {
    handle_scoped(state, req, "cohortId")
}

fn handle_gpa_cumulative(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match dropped_policy(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match rollup::cumulative_gpa(conn, &student_id, policy) {
        Ok(summary) => ok(&req.id, json!({ "studentId": student_id, "gpa": summary })),
        Err(e) => calc_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gpa.term" => Some(handle_gpa_term(state, req)),
        "gpa.cohort" => Some(handle_gpa_cohort(state, req)),
        "gpa.cumulative" => Some(handle_gpa_cumulative(state, req)),
        _ => None,
    }
}
