use crate::calc::CalcError;
use crate::db;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const GPA_POLICY_KEY: &str = "gpa.policy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    Dropped,
    Completed,
    Failed,
}

impl EnrollmentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "enrolled" => Some(Self::Enrolled),
            "dropped" => Some(Self::Dropped),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// How a dropped enrollment that still carries grade points is treated in GPA rollups.
/// Dropped enrollments without grade points never count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DroppedPolicy {
    #[default]
    Exclude,
    IncludeGraded,
}

impl DroppedPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exclude" => Some(Self::Exclude),
            "include_graded" => Some(Self::IncludeGraded),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclude => "exclude",
            Self::IncludeGraded => "include_graded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpaScope {
    Term(String),
    Cohort(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupRow {
    pub status: Option<EnrollmentStatus>,
    pub credits: f64,
    pub grade_points: Option<f64>,
}

impl RollupRow {
    pub fn counts(&self, policy: DroppedPolicy) -> bool {
        if self.grade_points.is_none() {
            return false;
        }
        match (self.status, policy) {
            (Some(EnrollmentStatus::Dropped), DroppedPolicy::Exclude) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpaSummary {
    pub gpa: Option<f64>,
    pub quality_points: f64,
    pub attempted_credits: f64,
    pub earned_credits: f64,
    pub enrollment_count: usize,
    pub dropped_policy: DroppedPolicy,
}

/// Credit-weighted GPA: sum(points * credits) / sum(credits) over counted rows.
/// `gpa` is `None` when no counted row carries credit.
pub fn rollup<'a, I>(rows: I, policy: DroppedPolicy) -> GpaSummary
where
    I: IntoIterator<Item = &'a RollupRow>,
{
    let mut quality_points = 0.0_f64;
    let mut attempted_credits = 0.0_f64;
    let mut earned_credits = 0.0_f64;
    let mut enrollment_count: usize = 0;

    for row in rows {
        if !row.counts(policy) {
            continue;
        }
        let Some(points) = row.grade_points else {
            continue;
        };
        enrollment_count += 1;
        quality_points += points * row.credits;
        attempted_credits += row.credits;
        if points > 0.0 && row.status != Some(EnrollmentStatus::Failed) {
            earned_credits += row.credits;
        }
    }

    let gpa = if attempted_credits > 0.0 {
        Some(quality_points / attempted_credits)
    } else {
        None
    };

    GpaSummary {
        gpa,
        quality_points,
        attempted_credits,
        earned_credits,
        enrollment_count,
        dropped_policy: policy,
    }
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, CalcError> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |_| Ok(()))
        .optional()
        .map(|v| v.is_some())
        .map_err(CalcError::query)
}

pub fn load_rollup_rows(
    conn: &Connection,
    student_id: &str,
    scope: Option<&GpaScope>,
) -> Result<Vec<RollupRow>, CalcError> {
    let mut sql = String::from(
        "SELECT e.status, COALESCE(c.credits, 0), e.grade_points
         FROM enrollments e
         JOIN course_offerings o ON o.id = e.course_offering_id
         JOIN courses c ON c.id = o.course_id
         WHERE e.student_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(student_id.to_string())];
    match scope {
        Some(GpaScope::Term(id)) => {
            sql.push_str(" AND o.term_id = ?");
            binds.push(Value::Text(id.clone()));
        }
        Some(GpaScope::Cohort(id)) => {
            sql.push_str(" AND o.cohort_id = ?");
            binds.push(Value::Text(id.clone()));
        }
        None => {}
    }
    let mut stmt = conn.prepare(&sql).map_err(CalcError::query)?;
    stmt.query_map(params_from_iter(binds), |r| {
        let status: String = r.get(0)?;
        Ok(RollupRow {
            status: EnrollmentStatus::parse(&status),
            credits: r.get(1)?,
            grade_points: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::query)
}

fn ensure_student(conn: &Connection, student_id: &str) -> Result<(), CalcError> {
    if student_exists(conn, student_id)? {
        Ok(())
    } else {
        Err(CalcError::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id })))
    }
}

/// GPA over one term or cohort, read from the cached enrollment grades.
pub fn scoped_gpa(
    conn: &Connection,
    student_id: &str,
    scope: &GpaScope,
    policy: DroppedPolicy,
) -> Result<GpaSummary, CalcError> {
    ensure_student(conn, student_id)?;
    let rows = load_rollup_rows(conn, student_id, Some(scope))?;
    Ok(rollup(&rows, policy))
}

pub fn cumulative_gpa(
    conn: &Connection,
    student_id: &str,
    policy: DroppedPolicy,
) -> Result<GpaSummary, CalcError> {
    ensure_student(conn, student_id)?;
    let rows = load_rollup_rows(conn, student_id, None)?;
    Ok(rollup(&rows, policy))
}

/// Workspace policy from settings; unreadable or missing values fall back to the default.
pub fn load_dropped_policy(conn: &Connection) -> DroppedPolicy {
    match db::settings_get_json(conn, GPA_POLICY_KEY) {
        Ok(Some(v)) => v
            .get("droppedEnrollments")
            .and_then(|p| p.as_str())
            .and_then(DroppedPolicy::parse)
            .unwrap_or_default(),
        Ok(None) => DroppedPolicy::default(),
        Err(e) => {
            tracing::warn!(error = %e, "unreadable gpa policy setting; using default");
            DroppedPolicy::default()
        }
    }
}
