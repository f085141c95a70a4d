use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("termreport.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    // Roster membership. Only status = 'active' rows take part in a batch.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_enrollments_student ON class_enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_enrollments(
            batch_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(batch_id, student_id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batch_enrollments_student ON batch_enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_school ON subjects(school_id, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_types(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_system INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    // grade_bands.id doubles as the grade id stored on report details.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_bands(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            min_score REAL NOT NULL,
            max_score REAL NOT NULL,
            grade_name TEXT NOT NULL,
            interpretation TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_bands_school ON grade_bands(school_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            academic_term_id TEXT NOT NULL,
            exam_type_id TEXT,
            category TEXT,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_scope
           ON assessments(subject_id, class_id, academic_year_id, academic_term_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_results(
            assessment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            converted_score REAL,
            updated_at TEXT,
            PRIMARY KEY(assessment_id, student_id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_results_student ON assessment_results(student_id)",
        [],
    )?;

    // Engine-owned tables. The UNIQUE constraints are the natural keys the
    // upserts conflict on.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_reports(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            academic_term_id TEXT NOT NULL,
            total_marks REAL NOT NULL DEFAULT 0,
            average_score REAL NOT NULL DEFAULT 0,
            rank TEXT NOT NULL DEFAULT 'N/A',
            overall_remark TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, academic_year_id, academic_term_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_term_reports_period
           ON term_reports(academic_year_id, academic_term_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS term_report_details(
            id TEXT PRIMARY KEY,
            term_report_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            class_score REAL NOT NULL DEFAULT 0,
            exam_score REAL NOT NULL DEFAULT 0,
            total_score REAL NOT NULL DEFAULT 0,
            class_position INTEGER NOT NULL DEFAULT 0,
            batch_position INTEGER,
            grade_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(term_report_id) REFERENCES term_reports(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(term_report_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_term_report_details_subject ON term_report_details(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_locks(
            class_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            academic_term_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            started_at_ms INTEGER NOT NULL,
            PRIMARY KEY(class_id, academic_year_id, academic_term_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workspace_settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    ensure_term_reports_overall_remark(conn)?;

    Ok(())
}

fn ensure_term_reports_overall_remark(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "term_reports", "overall_remark")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE term_reports ADD COLUMN overall_remark TEXT", [])?;
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
            "SELECT value_json FROM workspace_settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO workspace_settings(key, value_json)
         VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
