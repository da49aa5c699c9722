use crate::scale::GradingScale;
use crate::weighting::{adjusted_score, AssessmentWeight, WeightGroup};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Why an enrollment's cached grade looks the way it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    /// No published, regular grade yet.
    Ungraded,
    Resolved,
    /// Average stored, letter/points left empty until a default scale exists.
    NoDefaultScale,
    /// Graded work exists but every graded group carries zero weight.
    ZeroWeight,
}

impl GradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeStatus::Ungraded => "ungraded",
            GradeStatus::Resolved => "resolved",
            GradeStatus::NoDefaultScale => "no_default_scale",
            GradeStatus::ZeroWeight => "zero_weight",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ungraded" => Some(GradeStatus::Ungraded),
            "resolved" => Some(GradeStatus::Resolved),
            "no_default_scale" => Some(GradeStatus::NoDefaultScale),
            "zero_weight" => Some(GradeStatus::ZeroWeight),
            _ => None,
        }
    }
}

/// One grade row joined with the assessment facts the aggregation needs.
#[derive(Debug, Clone)]
pub struct GradedItem {
    pub assessment_id: String,
    pub weight: AssessmentWeight,
    pub max_score: f64,
    pub is_extra_credit: bool,
    pub published: bool,
    pub score: f64,
    pub is_late: bool,
    pub late_penalty: Option<f64>,
}

impl GradedItem {
    fn adjusted_percent(&self) -> f64 {
        100.0 * adjusted_score(self.score, self.is_late, self.late_penalty) / self.max_score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentGrade {
    pub weighted_average: Option<f64>,
    pub final_letter_grade: Option<String>,
    pub grade_points: Option<f64>,
    pub grade_status: GradeStatus,
    pub grade_scale_id: Option<String>,
    pub regular_count: usize,
    pub extra_credit_count: usize,
    pub extra_credit_bonus: f64,
}

impl EnrollmentGrade {
    fn unresolved(status: GradeStatus, regular_count: usize, extra_credit_count: usize, bonus: f64) -> Self {
        Self {
            weighted_average: None,
            final_letter_grade: None,
            grade_points: None,
            grade_status: status,
            grade_scale_id: None,
            regular_count,
            extra_credit_count,
            extra_credit_bonus: bonus,
        }
    }
}

/// Weighted course grade for one enrollment.
///
/// Regular grades are averaged per weight group (category, or a standalone assessment
/// carrying its own weight) and the group means are combined over the weights of the
/// groups that actually hold grades, so ungraded categories never drag the average
/// down. Extra credit is added afterwards without normalization or clamping. Only
/// published assessments count.
pub fn aggregate_enrollment(items: &[GradedItem], scale: Option<&GradingScale>) -> EnrollmentGrade {
    let mut groups: BTreeMap<WeightGroup, (f64, usize, f64)> = BTreeMap::new(); // sum%, n, weight
    let mut bonus = 0.0_f64;
    let mut regular_count: usize = 0;
    let mut extra_credit_count: usize = 0;

    for item in items {
        if !item.published {
            continue;
        }
        if item.max_score <= 0.0 {
            tracing::warn!(
                assessment_id = %item.assessment_id,
                max_score = item.max_score,
                "assessment has non-positive max score; grade skipped"
            );
            continue;
        }
        if item.is_extra_credit {
            extra_credit_count += 1;
            bonus += item.adjusted_percent() * item.weight.value();
            continue;
        }
        regular_count += 1;
        let key = WeightGroup::for_assessment(&item.assessment_id, &item.weight);
        let entry = groups.entry(key).or_insert((0.0, 0, item.weight.value()));
        entry.0 += item.adjusted_percent();
        entry.1 += 1;
    }

    if regular_count == 0 {
        return EnrollmentGrade::unresolved(GradeStatus::Ungraded, 0, extra_credit_count, bonus);
    }

    let mut weighted_sum = 0.0_f64;
    let mut weight_denom = 0.0_f64;
    for (sum, count, weight) in groups.values() {
        let group_avg = *sum / (*count as f64);
        weighted_sum += group_avg * *weight;
        weight_denom += *weight;
    }
    if weight_denom <= 0.0 {
        return EnrollmentGrade::unresolved(
            GradeStatus::ZeroWeight,
            regular_count,
            extra_credit_count,
            bonus,
        );
    }

    let average = weighted_sum / weight_denom + bonus;
    let resolution = scale.and_then(|s| s.resolve(average).map(|r| (s.id.clone(), r)));
    match resolution {
        Some((scale_id, r)) => EnrollmentGrade {
            weighted_average: Some(average),
            final_letter_grade: Some(r.letter),
            grade_points: Some(r.gpa_points),
            grade_status: GradeStatus::Resolved,
            grade_scale_id: Some(scale_id),
            regular_count,
            extra_credit_count,
            extra_credit_bonus: bonus,
        },
        None => EnrollmentGrade {
            weighted_average: Some(average),
            final_letter_grade: None,
            grade_points: None,
            grade_status: GradeStatus::NoDefaultScale,
            grade_scale_id: None,
            regular_count,
            extra_credit_count,
            extra_credit_bonus: bonus,
        },
    }
}

/// A cache resolved against a scale that is no longer the default (or left
/// unresolved while a default now exists) is stale until the next recompute.
pub fn is_cache_stale(
    grade_status: GradeStatus,
    grade_scale_id: Option<&str>,
    default_scale_id: Option<&str>,
) -> bool {
    match grade_status {
        GradeStatus::Resolved => grade_scale_id != default_scale_id,
        GradeStatus::NoDefaultScale => default_scale_id.is_some(),
        GradeStatus::Ungraded | GradeStatus::ZeroWeight => false,
    }
}

/// A category without a course applies everywhere; a course-scoped one only to its own course.
pub fn category_in_scope(category_course_id: Option<&str>, offering_course_id: &str) -> bool {
    category_course_id.map_or(true, |c| c == offering_course_id)
}

pub fn load_graded_items(conn: &Connection, enrollment_id: &str) -> Result<Vec<GradedItem>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.category_id, COALESCE(c.weight, 0), a.weight, a.max_score,
                    a.is_extra_credit, a.status, g.score, g.is_late, g.late_penalty,
                    c.course_id, o.course_id
             FROM grades g
             JOIN assessments a ON a.id = g.assessment_id
             JOIN course_offerings o ON o.id = a.course_offering_id
             LEFT JOIN assessment_categories c ON c.id = a.category_id
             WHERE g.enrollment_id = ?
             ORDER BY a.sort_order, a.id",
        )
        .map_err(CalcError::query)?;
    stmt.query_map([enrollment_id], |r| {
        let assessment_id: String = r.get(0)?;
        let category_id: String = r.get(1)?;
        let category_weight: f64 = r.get(2)?;
        let override_weight: Option<f64> = r.get(3)?;
        let status: String = r.get(6)?;
        let category_course_id: Option<String> = r.get(10)?;
        let offering_course_id: String = r.get(11)?;
        if !category_in_scope(category_course_id.as_deref(), &offering_course_id) {
            tracing::warn!(
                enrollment_id,
                assessment_id = %assessment_id,
                category_id = %category_id,
                category_course_id = ?category_course_id,
                offering_course_id = %offering_course_id,
                "assessment uses a category scoped to a different course"
            );
        }
        Ok(GradedItem {
            assessment_id,
            weight: AssessmentWeight::resolve(override_weight, &category_id, category_weight),
            max_score: r.get(4)?,
            is_extra_credit: r.get::<_, i64>(5)? != 0,
            published: status == "published",
            score: r.get(7)?,
            is_late: r.get::<_, i64>(8)? != 0,
            late_penalty: r.get(9)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::query)
}

/// Writes only the grade cache columns. `status` and `updated_at` stay untouched so a
/// recompute never reads as an edit of the enrollment itself.
fn write_grade_cache(
    conn: &Connection,
    enrollment_id: &str,
    grade: &EnrollmentGrade,
) -> Result<(), CalcError> {
    let changed = conn
        .execute(
            "UPDATE enrollments
             SET weighted_average = ?,
                 final_letter_grade = ?,
                 grade_points = ?,
                 grade_scale_id = ?,
                 grade_status = ?,
                 grades_computed_at = ?
             WHERE id = ?",
            (
                grade.weighted_average,
                grade.final_letter_grade.as_deref(),
                grade.grade_points,
                grade.grade_scale_id.as_deref(),
                grade.grade_status.as_str(),
                chrono::Utc::now().to_rfc3339(),
                enrollment_id,
            ),
        )
        .map_err(|e| {
            CalcError::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "enrollments" }))
        })?;
    if changed == 0 {
        return Err(CalcError::new("not_found", "enrollment not found")
            .with_details(json!({ "enrollmentId": enrollment_id })));
    }
    tracing::debug!(
        enrollment_id,
        cache = true,
        weighted_average = ?grade.weighted_average,
        letter = ?grade.final_letter_grade,
        status = grade.grade_status.as_str(),
        "enrollment grade cache written"
    );
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeOutcome {
    pub enrollment_id: String,
    #[serde(flatten)]
    pub grade: EnrollmentGrade,
}

pub fn recompute_enrollment(
    conn: &Connection,
    enrollment_id: &str,
    scale: Option<&GradingScale>,
) -> Result<RecomputeOutcome, CalcError> {
    let items = load_graded_items(conn, enrollment_id)?;
    let grade = aggregate_enrollment(&items, scale);
    if grade.grade_status == GradeStatus::NoDefaultScale {
        tracing::warn!(
            enrollment_id,
            "no default grading scale; weighted average stored without letter grade"
        );
    }
    write_grade_cache(conn, enrollment_id, &grade)?;
    Ok(RecomputeOutcome {
        enrollment_id: enrollment_id.to_string(),
        grade,
    })
}

/// Recomputes each distinct enrollment once, in first-seen order.
pub fn recompute_distinct<'a, I>(
    conn: &Connection,
    enrollment_ids: I,
    scale: Option<&GradingScale>,
) -> Result<Vec<RecomputeOutcome>, CalcError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for id in enrollment_ids {
        if !seen.insert(id) {
            continue;
        }
        out.push(recompute_enrollment(conn, id, scale)?);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecomputeScope {
    All,
    CourseOffering(String),
    Term(String),
}

pub fn enrollment_ids_in_scope(
    conn: &Connection,
    scope: &RecomputeScope,
) -> Result<Vec<String>, CalcError> {
    let (sql, binds): (&str, Vec<Value>) = match scope {
        RecomputeScope::All => ("SELECT id FROM enrollments ORDER BY id", Vec::new()),
        RecomputeScope::CourseOffering(id) => (
            "SELECT id FROM enrollments WHERE course_offering_id = ? ORDER BY id",
            vec![Value::Text(id.clone())],
        ),
        RecomputeScope::Term(id) => (
            "SELECT e.id
             FROM enrollments e
             JOIN course_offerings o ON o.id = e.course_offering_id
             WHERE o.term_id = ?
             ORDER BY e.id",
            vec![Value::Text(id.clone())],
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(CalcError::query)?;
    stmt.query_map(params_from_iter(binds), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::query)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEnrollmentGrade {
    pub enrollment_id: String,
    pub student_id: String,
    pub course_offering_id: String,
    pub status: String,
    pub weighted_average: Option<f64>,
    pub final_letter_grade: Option<String>,
    pub grade_points: Option<f64>,
    pub grade_status: GradeStatus,
    pub grade_scale_id: Option<String>,
    pub grades_computed_at: Option<String>,
    pub stale: bool,
}

pub fn load_cached_grade(
    conn: &Connection,
    enrollment_id: &str,
    default_scale_id: Option<&str>,
) -> Result<Option<CachedEnrollmentGrade>, CalcError> {
    let row = conn
        .query_row(
            "SELECT id, student_id, course_offering_id, status, weighted_average,
                    final_letter_grade, grade_points, grade_status, grade_scale_id,
                    grades_computed_at
             FROM enrollments
             WHERE id = ?",
            [enrollment_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<f64>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<f64>>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, Option<String>>(8)?,
                    r.get::<_, Option<String>>(9)?,
                ))
            },
        )
        .optional()
        .map_err(CalcError::query)?;
    let Some((
        enrollment_id,
        student_id,
        course_offering_id,
        status,
        weighted_average,
        final_letter_grade,
        grade_points,
        grade_status_raw,
        grade_scale_id,
        grades_computed_at,
    )) = row
    else {
        return Ok(None);
    };
    let grade_status = GradeStatus::parse(&grade_status_raw).unwrap_or(GradeStatus::Ungraded);
    let stale = is_cache_stale(grade_status, grade_scale_id.as_deref(), default_scale_id);
    Ok(Some(CachedEnrollmentGrade {
        enrollment_id,
        student_id,
        course_offering_id,
        status,
        weighted_average,
        final_letter_grade,
        grade_points,
        grade_status,
        grade_scale_id,
        grades_computed_at,
        stale,
    }))
}
