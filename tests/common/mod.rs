#![allow(dead_code)]

use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos(),
        Uuid::new_v4()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_gradebookd");
        let mut child = Command::new(exe)
            .env_remove("GRADEBOOKD_WORKSPACE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn gradebookd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin: Some(stdin),
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Raw response envelope.
    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let stdin = self.stdin.as_mut().expect("stdin open");
        writeln!(stdin, "{}", payload).expect("write request");
        stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Error code of a failed request; panics if the request succeeded.
    pub fn request_err(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn select_workspace(&mut self, workspace: &PathBuf) -> serde_json::Value {
        self.request_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        )
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.wait();
    }
}

/// Direct database access for seeding the records other services own.
pub struct Fixture {
    pub conn: Connection,
}

impl Fixture {
    pub fn open(workspace: &PathBuf) -> Self {
        let conn = Connection::open(workspace.join("gradebook.sqlite3")).expect("open db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("fk on");
        Self { conn }
    }

    pub fn student(&self, last: &str, first: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO students(id, last_name, first_name, student_no) VALUES(?, ?, ?, ?)",
                (&id, last, first, format!("S-{}", &id[..8])),
            )
            .expect("insert student");
        id
    }

    pub fn course(&self, code: &str, credits: f64) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO courses(id, code, title, credits) VALUES(?, ?, ?, ?)",
                (&id, code, format!("{} course", code), credits),
            )
            .expect("insert course");
        id
    }

    pub fn term(&self, name: &str, start_date: &str, sort_order: i64) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO terms(id, name, start_date, sort_order) VALUES(?, ?, ?, ?)",
                (&id, name, start_date, sort_order),
            )
            .expect("insert term");
        id
    }

    pub fn cohort(&self, name: &str, start_date: Option<&str>, sort_order: i64) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO cohorts(id, name, start_date, sort_order) VALUES(?, ?, ?, ?)",
                (&id, name, start_date, sort_order),
            )
            .expect("insert cohort");
        id
    }

    pub fn offering(&self, course_id: &str, term_id: Option<&str>, cohort_id: Option<&str>) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO course_offerings(id, course_id, term_id, cohort_id) VALUES(?, ?, ?, ?)",
                (&id, course_id, term_id, cohort_id),
            )
            .expect("insert offering");
        id
    }

    pub fn enrollment(&self, student_id: &str, offering_id: &str, status: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO enrollments(id, student_id, course_offering_id, status, updated_at)
                 VALUES(?, ?, ?, ?, ?)",
                (&id, student_id, offering_id, status, "2025-01-01T00:00:00+00:00"),
            )
            .expect("insert enrollment");
        id
    }

    pub fn category(&self, name: &str, weight: f64) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO assessment_categories(id, name, weight) VALUES(?, ?, ?)",
                (&id, name, weight),
            )
            .expect("insert category");
        id
    }

    pub fn assessment(
        &self,
        offering_id: &str,
        category_id: &str,
        title: &str,
        max_score: f64,
        weight: Option<f64>,
        is_extra_credit: bool,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO assessments(id, course_offering_id, category_id, title, max_score, weight,
                                         is_extra_credit, status, published_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, 'published', '2025-01-01T00:00:00+00:00')",
                (
                    &id,
                    offering_id,
                    category_id,
                    title,
                    max_score,
                    weight,
                    if is_extra_credit { 1_i64 } else { 0_i64 },
                ),
            )
            .expect("insert assessment");
        id
    }

    pub fn draft_assessment(&self, offering_id: &str, category_id: &str, title: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO assessments(id, course_offering_id, category_id, title, max_score, status)
                 VALUES(?, ?, ?, ?, 100.0, 'draft')",
                (&id, offering_id, category_id, title),
            )
            .expect("insert draft assessment");
        id
    }

    /// Seeds cached grade points directly, as a previously recomputed enrollment would hold.
    pub fn cache_points(&self, enrollment_id: &str, points: f64) {
        self.conn
            .execute(
                "UPDATE enrollments SET grade_points = ?, grade_status = 'resolved' WHERE id = ?",
                (points, enrollment_id),
            )
            .expect("seed cached points");
    }
}

pub fn create_standard_scale(sidecar: &mut Sidecar, name: &str, make_default: bool) -> String {
    let result = sidecar.request_ok(
        "scales.create",
        json!({
            "name": name,
            "makeDefault": make_default,
            "entries": [
                { "letter": "A", "minPercentage": 90.0, "gpaPoints": 4.0 },
                { "letter": "B", "minPercentage": 80.0, "gpaPoints": 3.0 },
                { "letter": "C", "minPercentage": 70.0, "gpaPoints": 2.0 },
                { "letter": "D", "minPercentage": 60.0, "gpaPoints": 1.0 },
                { "letter": "F", "minPercentage": 0.0, "gpaPoints": 0.0 }
            ]
        }),
    );
    result["scale"]["id"]
        .as_str()
        .expect("scale id")
        .to_string()
}

pub fn approx(v: &serde_json::Value, expected: f64) -> bool {
    v.as_f64()
        .map(|x| (x - expected).abs() < 1e-9)
        .unwrap_or(false)
}
