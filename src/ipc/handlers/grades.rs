use crate::calc::{self, RecomputeOutcome};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, default_scale, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use uuid::Uuid;

const GRADES_BULK_MAX_ROWS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

#[derive(Debug, Clone)]
struct GradeInput {
    enrollment_id: String,
    assessment_id: String,
    score: f64,
    is_late: bool,
    late_penalty: Option<f64>,
    notes: Option<String>,
}

fn parse_grade_input(obj: &Map<String, Value>) -> Result<GradeInput, HandlerErr> {
    let Some(enrollment_id) = obj.get("enrollmentId").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing enrollmentId"));
    };
    let Some(assessment_id) = obj.get("assessmentId").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing assessmentId"));
    };
    let Some(score) = obj.get("score").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::bad_params("missing/invalid score"));
    };
    if !score.is_finite() || score < 0.0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "score must be >= 0".to_string(),
            details: Some(json!({ "score": score })),
        });
    }
    let is_late = obj.get("isLate").and_then(|v| v.as_bool()).unwrap_or(false);
    let late_penalty = match obj.get("latePenalty") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(p) if (0.0..=100.0).contains(&p) => Some(p),
            _ => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "latePenalty must be between 0 and 100".to_string(),
                    details: Some(json!({ "latePenalty": v })),
                })
            }
        },
    };
    let notes = obj
        .get("notes")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(GradeInput {
        enrollment_id: enrollment_id.to_string(),
        assessment_id: assessment_id.to_string(),
        score,
        is_late,
        late_penalty,
        notes,
    })
}

/// A grade may only reference an assessment of the enrollment's own course offering
/// that is, or has been, published.
fn check_gradable(conn: &Connection, enrollment_id: &str, assessment_id: &str) -> Result<(), HandlerErr> {
    let query_err = |e: rusqlite::Error| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    };

    let offering: Option<String> = conn
        .query_row(
            "SELECT course_offering_id FROM enrollments WHERE id = ?",
            [enrollment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    let Some(offering) = offering else {
        return Err(HandlerErr {
            code: "not_found",
            message: "enrollment not found".to_string(),
            details: Some(json!({ "enrollmentId": enrollment_id })),
        });
    };

    let assessment: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT course_offering_id, status, published_at FROM assessments WHERE id = ?",
            [assessment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((assessment_offering, status, published_at)) = assessment else {
        return Err(HandlerErr {
            code: "not_found",
            message: "assessment not found".to_string(),
            details: Some(json!({ "assessmentId": assessment_id })),
        });
    };

    if assessment_offering != offering {
        return Err(HandlerErr {
            code: "bad_params",
            message: "assessment belongs to a different course offering".to_string(),
            details: Some(json!({
                "enrollmentId": enrollment_id,
                "assessmentId": assessment_id
            })),
        });
    }
    if status != "published" && published_at.is_none() {
        return Err(HandlerErr {
            code: "assessment_not_gradable",
            message: "assessment has never been published".to_string(),
            details: Some(json!({ "assessmentId": assessment_id, "status": status })),
        });
    }
    Ok(())
}

fn upsert_grade(conn: &Connection, g: &GradeInput) -> Result<(), HandlerErr> {
    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, enrollment_id, assessment_id, score, is_late, late_penalty, notes, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(enrollment_id, assessment_id) DO UPDATE SET
           score = excluded.score,
           is_late = excluded.is_late,
           late_penalty = excluded.late_penalty,
           notes = excluded.notes,
           updated_at = excluded.updated_at",
        (
            &grade_id,
            &g.enrollment_id,
            &g.assessment_id,
            g.score,
            if g.is_late { 1_i64 } else { 0_i64 },
            g.late_penalty,
            g.notes.as_deref(),
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;
    Ok(())
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(obj) = req.params.as_object() else {
        return err(&req.id, "bad_params", "params must be an object", None);
    };
    let input = match parse_grade_input(obj) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = check_gradable(conn, &input.enrollment_id, &input.assessment_id) {
        return e.response(&req.id);
    }
    let scale = match default_scale(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = upsert_grade(&tx, &input) {
        let _ = tx.rollback();
        return e.response(&req.id);
    }
    let outcome = match calc::recompute_enrollment(&tx, &input.enrollment_id, scale.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return calc_err(req, e);
        }
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "enrollment": outcome }))
}

fn handle_grades_bulk_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(rows) = req.params.get("grades").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing grades[]", None);
    };

    if rows.len() > GRADES_BULK_MAX_ROWS {
        let rejected = rows.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max rows: {} > {}",
                        rejected, GRADES_BULK_MAX_ROWS
                    )
                }]
            }),
        );
    }

    let scale = match default_scale(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut updated: usize = 0;
    let mut touched: Vec<String> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("grade at index {} must be an object", i),
            }));
            continue;
        };
        let input = match parse_grade_input(obj) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({ "index": i, "code": e.code, "message": e.message }));
                continue;
            }
        };
        if let Err(e) = check_gradable(&tx, &input.enrollment_id, &input.assessment_id) {
            errors.push(json!({ "index": i, "code": e.code, "message": e.message }));
            continue;
        }
        match upsert_grade(&tx, &input) {
            Ok(()) => {
                updated += 1;
                touched.push(input.enrollment_id);
            }
            Err(e) => errors.push(json!({ "index": i, "code": e.code, "message": e.message })),
        }
    }

    // One recompute per distinct enrollment, not per grade row.
    let recomputed: Vec<RecomputeOutcome> =
        match calc::recompute_distinct(&tx, touched.iter().map(String::as_str), scale.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return calc_err(req, e);
            }
        };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    tracing::info!(
        updated,
        rejected = errors.len(),
        enrollments = recomputed.len(),
        "bulk grade submission applied"
    );

    let mut result = json!({
        "ok": true,
        "updated": updated,
        "recomputed": recomputed,
    });
    if !errors.is_empty() {
        result["rejected"] = json!(errors.len());
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale = match default_scale(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let changed = match tx.execute(
        "DELETE FROM grades WHERE enrollment_id = ? AND assessment_id = ?",
        (&enrollment_id, &assessment_id),
    ) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "grades" })),
            );
        }
    };
    if changed == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "grade not found", None);
    }
    let outcome = match calc::recompute_enrollment(&tx, &enrollment_id, scale.as_ref()) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return calc_err(req, e);
        }
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "enrollment": outcome }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.bulkUpsert" => Some(handle_grades_bulk_upsert(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
