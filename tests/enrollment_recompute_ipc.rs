mod common;

use common::{approx, create_standard_scale, temp_dir, Fixture, Sidecar};
use serde_json::json;

struct Course {
    fx: Fixture,
    offering: String,
    enrollment: String,
}

fn setup(sidecar: &mut Sidecar, prefix: &str) -> (std::path::PathBuf, Course) {
    let workspace = temp_dir(prefix);
    sidecar.select_workspace(&workspace);
    create_standard_scale(sidecar, "Standard", true);

    let fx = Fixture::open(&workspace);
    let student = fx.student("Student", "One");
    let course = fx.course("MTH101", 3.0);
    let offering = fx.offering(&course, None, None);
    let enrollment = fx.enrollment(&student, &offering, "enrolled");
    (
        workspace,
        Course {
            fx,
            offering,
            enrollment,
        },
    )
}

fn grade(
    sidecar: &mut Sidecar,
    enrollment: &str,
    assessment: &str,
    score: f64,
) -> serde_json::Value {
    sidecar.request_ok(
        "grades.upsert",
        json!({ "enrollmentId": enrollment, "assessmentId": assessment, "score": score }),
    )
}

#[test]
fn fully_graded_equal_categories_average_to_85() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-full");
    let homework = c.fx.category("Homework", 0.5);
    let exams = c.fx.category("Exams", 0.5);
    let hw = c.fx.assessment(&c.offering, &homework, "HW1", 100.0, None, false);
    let ex = c.fx.assessment(&c.offering, &exams, "Midterm", 50.0, None, false);

    grade(&mut sidecar, &c.enrollment, &hw, 80.0);
    let res = grade(&mut sidecar, &c.enrollment, &ex, 45.0);

    let e = &res["enrollment"];
    assert!(approx(&e["weightedAverage"], 85.0), "{}", e);
    assert_eq!(e["finalLetterGrade"], "B");
    assert!(approx(&e["gradePoints"], 3.0));
    assert_eq!(e["gradeStatus"], "resolved");
    assert_eq!(e["regularCount"], 2);

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn partially_graded_course_normalizes_over_graded_categories() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-partial");
    let quizzes = c.fx.category("Quizzes", 0.3);
    let labs = c.fx.category("Labs", 0.3);
    let exams = c.fx.category("Exams", 0.4);
    let q1 = c.fx.assessment(&c.offering, &quizzes, "Quiz 1", 10.0, None, false);
    // Configured but ungraded.
    let _lab = c.fx.assessment(&c.offering, &labs, "Lab 1", 20.0, None, false);
    let _final = c.fx.assessment(&c.offering, &exams, "Final", 100.0, None, false);

    let res = grade(&mut sidecar, &c.enrollment, &q1, 10.0);
    assert!(approx(&res["enrollment"]["weightedAverage"], 100.0), "{}", res);
    assert_eq!(res["enrollment"]["finalLetterGrade"], "A");

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn late_penalty_is_applied_before_aggregation() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-late");
    let homework = c.fx.category("Homework", 1.0);
    let hw = c.fx.assessment(&c.offering, &homework, "HW1", 100.0, None, false);

    let res = sidecar.request_ok(
        "grades.upsert",
        json!({
            "enrollmentId": c.enrollment,
            "assessmentId": hw,
            "score": 100.0,
            "isLate": true,
            "latePenalty": 10.0,
            "notes": "two days late"
        }),
    );
    assert!(approx(&res["enrollment"]["weightedAverage"], 90.0), "{}", res);
    assert_eq!(res["enrollment"]["finalLetterGrade"], "A");

    // Penalty without the late flag is ignored.
    let res = sidecar.request_ok(
        "grades.upsert",
        json!({
            "enrollmentId": c.enrollment,
            "assessmentId": hw,
            "score": 85.0,
            "isLate": false,
            "latePenalty": 10.0
        }),
    );
    assert!(approx(&res["enrollment"]["weightedAverage"], 85.0), "{}", res);

    let code = sidecar.request_err(
        "grades.upsert",
        json!({
            "enrollmentId": c.enrollment,
            "assessmentId": hw,
            "score": 85.0,
            "isLate": true,
            "latePenalty": 140.0
        }),
    );
    assert_eq!(code, "bad_params");

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn extra_credit_adds_on_top_and_deleting_it_restores_base() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-bonus");
    let homework = c.fx.category("Homework", 0.5);
    let exams = c.fx.category("Exams", 0.5);
    let bonus = c.fx.category("Bonus", 0.0);
    let hw = c.fx.assessment(&c.offering, &homework, "HW1", 100.0, None, false);
    let ex = c.fx.assessment(&c.offering, &exams, "Midterm", 100.0, None, false);
    let xc = c.fx.assessment(&c.offering, &bonus, "Puzzle", 100.0, Some(0.05), true);

    grade(&mut sidecar, &c.enrollment, &hw, 80.0);
    let base = grade(&mut sidecar, &c.enrollment, &ex, 90.0);
    assert!(approx(&base["enrollment"]["weightedAverage"], 85.0));

    let boosted = grade(&mut sidecar, &c.enrollment, &xc, 100.0);
    let avg = boosted["enrollment"]["weightedAverage"].as_f64().expect("avg");
    assert!((avg - 90.0).abs() < 1e-9, "expected 90, got {}", avg);
    assert_eq!(boosted["enrollment"]["finalLetterGrade"], "A");
    assert_eq!(boosted["enrollment"]["extraCreditCount"], 1);

    let restored = sidecar.request_ok(
        "grades.delete",
        json!({ "enrollmentId": c.enrollment, "assessmentId": xc }),
    );
    assert_eq!(
        restored["enrollment"]["weightedAverage"],
        base["enrollment"]["weightedAverage"]
    );
    assert_eq!(restored["enrollment"]["finalLetterGrade"], "B");

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn extra_credit_only_leaves_enrollment_ungraded() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-xc-only");
    let bonus = c.fx.category("Bonus", 0.1);
    let xc = c.fx.assessment(&c.offering, &bonus, "Puzzle", 10.0, None, true);

    let res = grade(&mut sidecar, &c.enrollment, &xc, 10.0);
    let e = &res["enrollment"];
    assert!(e["weightedAverage"].is_null(), "{}", e);
    assert!(e["finalLetterGrade"].is_null());
    assert!(e["gradePoints"].is_null());
    assert_eq!(e["gradeStatus"], "ungraded");

    let row: (Option<f64>, Option<String>, Option<f64>) = c
        .fx
        .conn
        .query_row(
            "SELECT weighted_average, final_letter_grade, grade_points FROM enrollments WHERE id = ?",
            [&c.enrollment],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .expect("enrollment row");
    assert_eq!(row, (None, None, None));

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn recompute_is_idempotent_and_leaves_other_fields_alone() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-idem");
    let quizzes = c.fx.category("Quizzes", 0.35);
    let exams = c.fx.category("Exams", 0.65);
    let q = c.fx.assessment(&c.offering, &quizzes, "Q1", 17.0, None, false);
    let e = c.fx.assessment(&c.offering, &exams, "E1", 23.0, None, false);
    grade(&mut sidecar, &c.enrollment, &q, 13.0);
    grade(&mut sidecar, &c.enrollment, &e, 19.5);

    let first = sidecar.request_ok("enrollments.recompute", json!({ "enrollmentId": c.enrollment }));
    let second = sidecar.request_ok("enrollments.recompute", json!({ "enrollmentId": c.enrollment }));
    for key in ["weightedAverage", "finalLetterGrade", "gradePoints", "gradeStatus"] {
        assert_eq!(first["enrollment"][key], second["enrollment"][key], "{}", key);
    }

    let (status, updated_at, computed_at): (String, String, Option<String>) = c
        .fx
        .conn
        .query_row(
            "SELECT status, updated_at, grades_computed_at FROM enrollments WHERE id = ?",
            [&c.enrollment],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .expect("enrollment row");
    assert_eq!(status, "enrolled");
    assert_eq!(updated_at, "2025-01-01T00:00:00+00:00");
    assert!(computed_at.is_some());

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn draft_assessments_reject_grades_and_unpublished_ones_stop_counting() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-draft");
    let homework = c.fx.category("Homework", 1.0);
    let draft = c.fx.draft_assessment(&c.offering, &homework, "Not yet");
    let hw1 = c.fx.assessment(&c.offering, &homework, "HW1", 10.0, None, false);
    let hw2 = c.fx.assessment(&c.offering, &homework, "HW2", 10.0, None, false);

    let code = sidecar.request_err(
        "grades.upsert",
        json!({ "enrollmentId": c.enrollment, "assessmentId": draft, "score": 5.0 }),
    );
    assert_eq!(code, "assessment_not_gradable");

    grade(&mut sidecar, &c.enrollment, &hw1, 10.0);
    let both = grade(&mut sidecar, &c.enrollment, &hw2, 5.0);
    assert!(approx(&both["enrollment"]["weightedAverage"], 75.0));

    // Pulled back to draft: the grade stays, and stays editable, but no longer counts.
    c.fx.conn
        .execute("UPDATE assessments SET status = 'draft' WHERE id = ?", [&hw2])
        .expect("unpublish");
    let res = grade(&mut sidecar, &c.enrollment, &hw2, 6.0);
    assert!(approx(&res["enrollment"]["weightedAverage"], 100.0), "{}", res);

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn grade_must_match_enrollment_course_offering() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-mismatch");
    let other_course = c.fx.course("ENG101", 3.0);
    let other_offering = c.fx.offering(&other_course, None, None);
    let cat = c.fx.category("Essays", 1.0);
    let foreign = c.fx.assessment(&other_offering, &cat, "Essay", 10.0, None, false);

    let code = sidecar.request_err(
        "grades.upsert",
        json!({ "enrollmentId": c.enrollment, "assessmentId": foreign, "score": 5.0 }),
    );
    assert_eq!(code, "bad_params");

    let code = sidecar.request_err(
        "grades.upsert",
        json!({ "enrollmentId": "missing", "assessmentId": foreign, "score": 5.0 }),
    );
    assert_eq!(code, "not_found");

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn assessment_published_by_status_update_stays_gradable_after_pullback() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-republish");
    let homework = c.fx.category("Homework", 1.0);
    let hw1 = c.fx.assessment(&c.offering, &homework, "HW1", 10.0, None, false);
    let late_add = c.fx.draft_assessment(&c.offering, &homework, "HW2");

    c.fx.conn
        .execute("UPDATE assessments SET status = 'published' WHERE id = ?", [&late_add])
        .expect("publish");
    grade(&mut sidecar, &c.enrollment, &hw1, 10.0);
    let both = grade(&mut sidecar, &c.enrollment, &late_add, 50.0);
    assert!(approx(&both["enrollment"]["weightedAverage"], 75.0), "{}", both);

    c.fx.conn
        .execute("UPDATE assessments SET status = 'draft' WHERE id = ?", [&late_add])
        .expect("unpublish");
    let res = grade(&mut sidecar, &c.enrollment, &late_add, 60.0);
    assert!(approx(&res["enrollment"]["weightedAverage"], 100.0), "{}", res);

    let score: f64 = c
        .fx
        .conn
        .query_row(
            "SELECT score FROM grades WHERE enrollment_id = ? AND assessment_id = ?",
            [&c.enrollment, &late_add],
            |r| r.get(0),
        )
        .expect("grade row");
    assert_eq!(score, 60.0);

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn category_scoped_to_another_course_still_aggregates() {
    let mut sidecar = Sidecar::spawn();
    let (workspace, c) = setup(&mut sidecar, "gradebook-recompute-category-scope");
    let other_course = c.fx.course("ART101", 2.0);
    let borrowed = c.fx.category("Studio", 1.0);
    c.fx.conn
        .execute(
            "UPDATE assessment_categories SET course_id = ? WHERE id = ?",
            [&other_course, &borrowed],
        )
        .expect("scope category");
    let piece = c.fx.assessment(&c.offering, &borrowed, "Portfolio", 20.0, None, false);

    let res = grade(&mut sidecar, &c.enrollment, &piece, 17.0);
    assert!(approx(&res["enrollment"]["weightedAverage"], 85.0), "{}", res);
    assert_eq!(res["enrollment"]["finalLetterGrade"], "B");

    drop(sidecar);
    let _ = std::fs::remove_dir_all(workspace);
}
