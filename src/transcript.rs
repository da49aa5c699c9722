use crate::calc::{is_cache_stale, CalcError, GradeStatus};
use crate::rollup::{rollup, DroppedPolicy, EnrollmentStatus, GpaSummary, RollupRow};
use crate::weighting::adjusted_score;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub id: String,
    pub display_name: String,
    pub student_no: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermSummary {
    pub id: String,
    pub name: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRow {
    pub enrollment_id: String,
    pub course_offering_id: String,
    pub course_code: String,
    pub course_title: String,
    pub credits: f64,
    pub status: String,
    pub term_id: Option<String>,
    pub term_name: Option<String>,
    pub weighted_average: Option<f64>,
    pub final_letter_grade: Option<String>,
    pub grade_points: Option<f64>,
    pub grade_status: GradeStatus,
    pub stale: bool,
}

impl EnrollmentRow {
    fn rollup_row(&self) -> RollupRow {
        RollupRow {
            status: EnrollmentStatus::parse(&self.status),
            credits: self.credits,
            grade_points: self.grade_points,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub assessment_id: String,
    pub title: String,
    pub category_name: Option<String>,
    pub max_score: f64,
    pub score: f64,
    pub adjusted_score: f64,
    pub is_late: bool,
    pub late_penalty: Option<f64>,
    pub is_extra_credit: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardEnrollment {
    #[serde(flatten)]
    pub enrollment: EnrollmentRow,
    pub grades: Vec<GradeRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardModel {
    pub student: StudentSummary,
    pub term: TermSummary,
    pub enrollments: Vec<ReportCardEnrollment>,
    pub term_gpa: GpaSummary,
    pub cumulative_gpa: GpaSummary,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortGroup {
    pub cohort_id: Option<String>,
    pub name: String,
    pub start_date: Option<String>,
    pub enrollments: Vec<EnrollmentRow>,
    pub gpa: GpaSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptModel {
    pub student: StudentSummary,
    /// Passed through for the renderer (watermark/footer); aggregation ignores it.
    pub official: bool,
    pub cohorts: Vec<CohortGroup>,
    pub cumulative_gpa: GpaSummary,
    pub total_attempted_credits: f64,
    pub total_earned_credits: f64,
    pub generated_at: String,
}

#[derive(Debug, Clone)]
struct SourceRow {
    row: EnrollmentRow,
    cohort_id: Option<String>,
    cohort_name: Option<String>,
    cohort_start: Option<String>,
    cohort_sort: i64,
    term_start: Option<String>,
    term_sort: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct AssembleContext<'a> {
    pub conn: &'a Connection,
    pub default_scale_id: Option<&'a str>,
    pub policy: DroppedPolicy,
}

fn load_student(conn: &Connection, student_id: &str) -> Result<StudentSummary, CalcError> {
    let row: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, last_name, first_name, student_no FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(CalcError::query)?;
    let Some((id, last, first, student_no)) = row else {
        return Err(CalcError::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id })));
    };
    Ok(StudentSummary {
        id,
        display_name: format!("{}, {}", last, first),
        student_no,
    })
}

fn load_term(conn: &Connection, term_id: &str) -> Result<TermSummary, CalcError> {
    conn.query_row(
        "SELECT id, name, start_date, end_date FROM terms WHERE id = ?",
        [term_id],
        |r| {
            Ok(TermSummary {
                id: r.get(0)?,
                name: r.get(1)?,
                start_date: r.get(2)?,
                end_date: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(CalcError::query)?
    .ok_or_else(|| {
        CalcError::new("not_found", "term not found").with_details(json!({ "termId": term_id }))
    })
}

fn load_source_rows(
    ctx: &AssembleContext<'_>,
    student_id: &str,
    term_id: Option<&str>,
) -> Result<Vec<SourceRow>, CalcError> {
    let mut sql = String::from(
        "SELECT e.id, e.course_offering_id, c.code, COALESCE(o.title, c.title), c.credits,
                e.status, e.weighted_average, e.final_letter_grade, e.grade_points,
                e.grade_status, e.grade_scale_id,
                t.id, t.name, t.start_date, COALESCE(t.sort_order, 0),
                h.id, h.name, h.start_date, COALESCE(h.sort_order, 0)
         FROM enrollments e
         JOIN course_offerings o ON o.id = e.course_offering_id
         JOIN courses c ON c.id = o.course_id
         LEFT JOIN terms t ON t.id = o.term_id
         LEFT JOIN cohorts h ON h.id = o.cohort_id
         WHERE e.student_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(student_id.to_string())];
    if let Some(t) = term_id {
        sql.push_str(" AND o.term_id = ?");
        binds.push(Value::Text(t.to_string()));
    }

    let default_scale_id = ctx.default_scale_id;
    let mut stmt = ctx.conn.prepare(&sql).map_err(CalcError::query)?;
    let mut rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let grade_status_raw: String = r.get(9)?;
            let grade_scale_id: Option<String> = r.get(10)?;
            let grade_status =
                GradeStatus::parse(&grade_status_raw).unwrap_or(GradeStatus::Ungraded);
            Ok(SourceRow {
                row: EnrollmentRow {
                    enrollment_id: r.get(0)?,
                    course_offering_id: r.get(1)?,
                    course_code: r.get(2)?,
                    course_title: r.get(3)?,
                    credits: r.get(4)?,
                    status: r.get(5)?,
                    weighted_average: r.get(6)?,
                    final_letter_grade: r.get(7)?,
                    grade_points: r.get(8)?,
                    grade_status,
                    stale: is_cache_stale(
                        grade_status,
                        grade_scale_id.as_deref(),
                        default_scale_id,
                    ),
                    term_id: r.get(11)?,
                    term_name: r.get(12)?,
                },
                term_start: r.get(13)?,
                term_sort: r.get(14)?,
                cohort_id: r.get(15)?,
                cohort_name: r.get(16)?,
                cohort_start: r.get(17)?,
                cohort_sort: r.get(18)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::query)?;

    rows.sort_by(|a, b| {
        cmp_dates(&a.term_start, &b.term_start)
            .then(a.term_sort.cmp(&b.term_sort))
            .then(a.row.course_code.cmp(&b.row.course_code))
            .then(a.row.enrollment_id.cmp(&b.row.enrollment_id))
    });
    Ok(rows)
}

/// Dated entries first, in ascending order; undated entries last.
fn cmp_dates(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn load_grade_rows(
    conn: &Connection,
    enrollment_ids: &[String],
) -> Result<HashMap<String, Vec<GradeRow>>, CalcError> {
    let mut out: HashMap<String, Vec<GradeRow>> = HashMap::new();
    if enrollment_ids.is_empty() {
        return Ok(out);
    }
    let placeholders = std::iter::repeat("?")
        .take(enrollment_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT g.enrollment_id, a.id, a.title, c.name, a.max_score, g.score,
                g.is_late, g.late_penalty, a.is_extra_credit, g.notes
         FROM grades g
         JOIN assessments a ON a.id = g.assessment_id
         LEFT JOIN assessment_categories c ON c.id = a.category_id
         WHERE g.enrollment_id IN ({}) AND a.status = 'published'
         ORDER BY a.sort_order, a.id",
        placeholders
    );
    let binds: Vec<Value> = enrollment_ids
        .iter()
        .map(|id| Value::Text(id.clone()))
        .collect();
    let mut stmt = conn.prepare(&sql).map_err(CalcError::query)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let enrollment_id: String = r.get(0)?;
            let score: f64 = r.get(5)?;
            let is_late = r.get::<_, i64>(6)? != 0;
            let late_penalty: Option<f64> = r.get(7)?;
            Ok((
                enrollment_id,
                GradeRow {
                    assessment_id: r.get(1)?,
                    title: r.get(2)?,
                    category_name: r.get(3)?,
                    max_score: r.get(4)?,
                    score,
                    adjusted_score: adjusted_score(score, is_late, late_penalty),
                    is_late,
                    late_penalty,
                    is_extra_credit: r.get::<_, i64>(8)? != 0,
                    notes: r.get(9)?,
                },
            ))
        })
        .map_err(CalcError::query)?;
    for row in rows {
        let (enrollment_id, grade) = row.map_err(CalcError::query)?;
        out.entry(enrollment_id).or_default().push(grade);
    }
    Ok(out)
}

fn gpa_of<'a, I>(rows: I, policy: DroppedPolicy) -> GpaSummary
where
    I: IntoIterator<Item = &'a EnrollmentRow>,
{
    let rollup_rows: Vec<RollupRow> = rows.into_iter().map(EnrollmentRow::rollup_row).collect();
    rollup(&rollup_rows, policy)
}

/// One term's enrollments with their published grades, plus term and cumulative GPA
/// read from the cached enrollment grades.
pub fn report_card_data(
    ctx: &AssembleContext<'_>,
    student_id: &str,
    term_id: &str,
) -> Result<ReportCardModel, CalcError> {
    let student = load_student(ctx.conn, student_id)?;
    let term = load_term(ctx.conn, term_id)?;

    let all_rows = load_source_rows(ctx, student_id, None)?;
    let cumulative_gpa = gpa_of(all_rows.iter().map(|s| &s.row), ctx.policy);

    let term_rows: Vec<EnrollmentRow> = all_rows
        .into_iter()
        .filter(|s| s.row.term_id.as_deref() == Some(term_id))
        .map(|s| s.row)
        .collect();
    let term_gpa = gpa_of(&term_rows, ctx.policy);

    let ids: Vec<String> = term_rows.iter().map(|r| r.enrollment_id.clone()).collect();
    let mut grades = load_grade_rows(ctx.conn, &ids)?;
    let enrollments = term_rows
        .into_iter()
        .map(|enrollment| ReportCardEnrollment {
            grades: grades.remove(&enrollment.enrollment_id).unwrap_or_default(),
            enrollment,
        })
        .collect();

    Ok(ReportCardModel {
        student,
        term,
        enrollments,
        term_gpa,
        cumulative_gpa,
        generated_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Full academic record grouped by cohort. `official` only travels to the renderer.
pub fn transcript_data(
    ctx: &AssembleContext<'_>,
    student_id: &str,
    official: bool,
) -> Result<TranscriptModel, CalcError> {
    let student = load_student(ctx.conn, student_id)?;
    let rows = load_source_rows(ctx, student_id, None)?;
    let cumulative_gpa = gpa_of(rows.iter().map(|s| &s.row), ctx.policy);

    struct Pending {
        cohort_id: Option<String>,
        name: String,
        start_date: Option<String>,
        sort_order: i64,
        enrollments: Vec<EnrollmentRow>,
    }

    let mut groups: Vec<Pending> = Vec::new();
    let mut index_by_cohort: HashMap<Option<String>, usize> = HashMap::new();
    for s in rows {
        let idx = match index_by_cohort.get(&s.cohort_id) {
            Some(i) => *i,
            None => {
                groups.push(Pending {
                    cohort_id: s.cohort_id.clone(),
                    name: s
                        .cohort_name
                        .clone()
                        .unwrap_or_else(|| "Unassigned".to_string()),
                    start_date: s.cohort_start.clone(),
                    sort_order: s.cohort_sort,
                    enrollments: Vec::new(),
                });
                index_by_cohort.insert(s.cohort_id.clone(), groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[idx].enrollments.push(s.row);
    }

    groups.sort_by(|a, b| {
        a.cohort_id
            .is_none()
            .cmp(&b.cohort_id.is_none())
            .then(cmp_dates(&a.start_date, &b.start_date))
            .then(a.sort_order.cmp(&b.sort_order))
            .then(a.name.cmp(&b.name))
    });

    let cohorts = groups
        .into_iter()
        .map(|g| CohortGroup {
            gpa: gpa_of(&g.enrollments, ctx.policy),
            cohort_id: g.cohort_id,
            name: g.name,
            start_date: g.start_date,
            enrollments: g.enrollments,
        })
        .collect();

    Ok(TranscriptModel {
        student,
        official,
        cohorts,
        total_attempted_credits: cumulative_gpa.attempted_credits,
        total_earned_credits: cumulative_gpa.earned_credits,
        cumulative_gpa,
        generated_at: chrono::Utc::now().to_rfc3339(),
    })
}
