use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            credits REAL NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cohorts(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_offerings(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            term_id TEXT,
            cohort_id TEXT,
            title TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(cohort_id) REFERENCES cohorts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_offerings_term ON course_offerings(term_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_offerings_cohort ON course_offerings(cohort_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_offering_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'enrolled',
            weighted_average REAL,
            final_letter_grade TEXT,
            grade_points REAL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id),
            UNIQUE(student_id, course_offering_id)
        )",
        [],
    )?;
    // Older workspaces predate the cache bookkeeping columns.
    ensure_enrollments_cache_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_offering ON enrollments(course_offering_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_categories(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 0,
            course_id TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            course_offering_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            title TEXT NOT NULL,
            max_score REAL NOT NULL,
            weight REAL,
            is_extra_credit INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'draft',
            due_date TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id),
            FOREIGN KEY(category_id) REFERENCES assessment_categories(id)
        )",
        [],
    )?;
    ensure_assessments_published_at(&conn)?;
    // Assessment rows are written by other services that only flip `status`; stamp the
    // first publication here so formerly published assessments stay gradable.
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS trg_assessments_published_at_insert
         AFTER INSERT ON assessments
         WHEN NEW.status = 'published' AND NEW.published_at IS NULL
         BEGIN
           UPDATE assessments
           SET published_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
           WHERE id = NEW.id;
         END",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS trg_assessments_published_at_update
         AFTER UPDATE OF status ON assessments
         WHEN NEW.status = 'published' AND NEW.published_at IS NULL
         BEGIN
           UPDATE assessments
           SET published_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
           WHERE id = NEW.id;
         END",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_offering ON assessments(course_offering_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            assessment_id TEXT NOT NULL,
            score REAL NOT NULL,
            is_late INTEGER NOT NULL DEFAULT 0,
            late_penalty REAL,
            notes TEXT,
            updated_at TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            UNIQUE(enrollment_id, assessment_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_enrollment ON grades(enrollment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_assessment ON grades(assessment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_scales(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT
        )",
        [],
    )?;
    // At most one default row; the swap in scale::set_default keeps it at exactly one.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_grading_scales_single_default
         ON grading_scales(is_default) WHERE is_default = 1",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_scale_entries(
            id TEXT PRIMARY KEY,
            scale_id TEXT NOT NULL,
            letter TEXT NOT NULL,
            min_percentage REAL NOT NULL,
            gpa_points REAL NOT NULL,
            FOREIGN KEY(scale_id) REFERENCES grading_scales(id),
            UNIQUE(scale_id, letter)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grading_scale_entries_scale ON grading_scale_entries(scale_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_enrollments_cache_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "enrollments", "grade_scale_id")? {
        conn.execute("ALTER TABLE enrollments ADD COLUMN grade_scale_id TEXT", [])?;
    }
    if !table_has_column(conn, "enrollments", "grade_status")? {
        conn.execute(
            "ALTER TABLE enrollments ADD COLUMN grade_status TEXT NOT NULL DEFAULT 'ungraded'",
            [],
        )?;
        // Rows cached before the column existed were resolved if they carry a letter.
        conn.execute(
            "UPDATE enrollments SET grade_status = 'resolved' WHERE final_letter_grade IS NOT NULL",
            [],
        )?;
    }
    if !table_has_column(conn, "enrollments", "grades_computed_at")? {
        conn.execute(
            "ALTER TABLE enrollments ADD COLUMN grades_computed_at TEXT",
            [],
        )?;
    }
    Ok(())
}

fn ensure_assessments_published_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessments", "published_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assessments ADD COLUMN published_at TEXT", [])?;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE assessments SET published_at = ? WHERE status = 'published'",
        [&now],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, raw),
    )?;
    Ok(())
}
