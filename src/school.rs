//! Writes for the records the engine only reads: schools, roster, catalog and
//! assessment results. Kept minimal; they exist so a workspace can be fed
//! through IPC.

use rusqlite::Connection;
use uuid::Uuid;

use crate::store::{now_stamp, AcademicPeriod, StoreError};

pub const STATUS_ACTIVE: &str = "active";

fn new_id(id: Option<&str>) -> String {
    match id {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

pub fn create_school(conn: &Connection, id: Option<&str>, name: &str) -> Result<String, StoreError> {
    let id = new_id(id);
    conn.execute("INSERT INTO schools(id, name) VALUES(?, ?)", (&id, name))?;
    Ok(id)
}

pub fn create_class(conn: &Connection, id: Option<&str>, school_id: &str, name: &str) -> Result<String, StoreError> {
    let id = new_id(id);
    conn.execute(
        "INSERT INTO classes(id, school_id, name) VALUES(?, ?, ?)",
        (&id, school_id, name),
    )?;
    Ok(id)
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub id: Option<String>,
    pub school_id: String,
    pub first_name: String,
    pub last_name: String,
    pub student_no: Option<String>,
    pub class_id: Option<String>,
    pub batch_id: Option<String>,
}

/// Insert a student, enrolling them (active) in the class and batch if given.
pub fn create_student(conn: &Connection, s: &NewStudent) -> Result<String, StoreError> {
    let id = new_id(s.id.as_deref());
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO students(id, school_id, last_name, first_name, student_no) VALUES(?, ?, ?, ?, ?)",
        (&id, &s.school_id, &s.last_name, &s.first_name, &s.student_no),
    )?;
    if let Some(class_id) = &s.class_id {
        tx.execute(
            "INSERT INTO class_enrollments(class_id, student_id, status) VALUES(?, ?, ?)
             ON CONFLICT(class_id, student_id) DO UPDATE SET status = excluded.status",
            (class_id, &id, STATUS_ACTIVE),
        )?;
    }
    if let Some(batch_id) = &s.batch_id {
        tx.execute(
            "INSERT INTO batch_enrollments(batch_id, student_id, status) VALUES(?, ?, ?)
             ON CONFLICT(batch_id, student_id) DO UPDATE SET status = excluded.status",
            (batch_id, &id, STATUS_ACTIVE),
        )?;
    }
    tx.commit().map_err(StoreError::Commit)?;
    Ok(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentKind {
    Class,
    Batch,
}

impl EnrollmentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "class" => Some(Self::Class),
            "batch" => Some(Self::Batch),
            _ => None,
        }
    }
}

/// Upsert an enrollment row with the given status.
pub fn set_enrollment_status(
    conn: &Connection,
    kind: EnrollmentKind,
    group_id: &str,
    student_id: &str,
    status: &str,
) -> Result<(), StoreError> {
    let sql = match kind {
        EnrollmentKind::Class => {
            "INSERT INTO class_enrollments(class_id, student_id, status) VALUES(?, ?, ?)
             ON CONFLICT(class_id, student_id) DO UPDATE SET status = excluded.status"
        }
        EnrollmentKind::Batch => {
            "INSERT INTO batch_enrollments(batch_id, student_id, status) VALUES(?, ?, ?)
             ON CONFLICT(batch_id, student_id) DO UPDATE SET status = excluded.status"
        }
    };
    conn.execute(sql, (group_id, student_id, status))?;
    Ok(())
}

fn next_sort_order(conn: &Connection, sql: &str, key: &str) -> Result<i64, StoreError> {
    Ok(conn.query_row(sql, [key], |r| r.get(0))?)
}

pub fn create_subject(conn: &Connection, id: Option<&str>, school_id: &str, name: &str) -> Result<String, StoreError> {
    let id = new_id(id);
    let sort_order = next_sort_order(
        conn,
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM subjects WHERE school_id = ?",
        school_id,
    )?;
    conn.execute(
        "INSERT INTO subjects(id, school_id, name, sort_order) VALUES(?, ?, ?, ?)",
        (&id, school_id, name, sort_order),
    )?;
    Ok(id)
}

pub fn create_exam_type(
    conn: &Connection,
    id: Option<&str>,
    school_id: &str,
    name: &str,
    is_system: bool,
) -> Result<String, StoreError> {
    let id = new_id(id);
    let sort_order = next_sort_order(
        conn,
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM exam_types WHERE school_id = ?",
        school_id,
    )?;
    conn.execute(
        "INSERT INTO exam_types(id, school_id, name, is_system, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&id, school_id, name, is_system as i64, sort_order),
    )?;
    Ok(id)
}

#[derive(Debug, Clone)]
pub struct NewBand {
    pub id: Option<String>,
    pub grade_name: String,
    pub min_score: f64,
    pub max_score: f64,
    pub interpretation: Option<String>,
}

#[cfg(test)]
impl NewBand {
    pub fn new(grade_name: &str, min_score: f64, max_score: f64, interpretation: &str) -> Self {
        Self {
            id: None,
            grade_name: grade_name.to_string(),
            min_score,
            max_score,
            interpretation: Some(interpretation.to_string()),
        }
    }
}

/// Replace a school's bands wholesale; list order becomes match order.
/// Reusing band ids keeps grades already written to reports resolvable.
pub fn replace_grade_bands(conn: &Connection, school_id: &str, bands: &[NewBand]) -> Result<Vec<String>, StoreError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM grade_bands WHERE school_id = ?", [school_id])?;
    let mut ids = Vec::with_capacity(bands.len());
    for (i, b) in bands.iter().enumerate() {
        let id = new_id(b.id.as_deref());
        tx.execute(
            "INSERT INTO grade_bands(id, school_id, sort_order, min_score, max_score, grade_name, interpretation)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (&id, school_id, i as i64, b.min_score, b.max_score, &b.grade_name, &b.interpretation),
        )?;
        ids.push(id);
    }
    tx.commit().map_err(StoreError::Commit)?;
    Ok(ids)
}

#[derive(Debug, Clone)]
pub struct NewAssessment {
    pub id: Option<String>,
    pub subject_id: String,
    pub class_id: String,
    pub period: AcademicPeriod,
    pub exam_type_id: Option<String>,
    pub category: Option<String>,
    pub name: String,
}

pub fn create_assessment(conn: &Connection, a: &NewAssessment) -> Result<String, StoreError> {
    let id = new_id(a.id.as_deref());
    let sort_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM assessments
         WHERE subject_id = ? AND class_id = ? AND academic_year_id = ? AND academic_term_id = ?",
        (
            &a.subject_id,
            &a.class_id,
            &a.period.academic_year_id,
            &a.period.academic_term_id,
        ),
        |r| r.get(0),
    )?;
    conn.execute(
        "INSERT INTO assessments(
           id, subject_id, class_id, academic_year_id, academic_term_id,
           exam_type_id, category, name, sort_order
         )
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &a.subject_id,
            &a.class_id,
            &a.period.academic_year_id,
            &a.period.academic_term_id,
            &a.exam_type_id,
            &a.category,
            &a.name,
            sort_order,
        ),
    )?;
    Ok(id)
}

pub fn upsert_result(
    conn: &Connection,
    assessment_id: &str,
    student_id: &str,
    converted_score: Option<f64>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO assessment_results(assessment_id, student_id, converted_score, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(assessment_id, student_id) DO UPDATE SET
           converted_score = excluded.converted_score,
           updated_at = excluded.updated_at",
        (assessment_id, student_id, converted_score, now_stamp()),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ResultEntry {
    pub assessment_id: String,
    pub student_id: String,
    pub converted_score: Option<f64>,
}

/// All-or-nothing bulk upsert. Returns the number of rows written.
pub fn upsert_results(conn: &Connection, entries: &[ResultEntry]) -> Result<usize, StoreError> {
    let tx = conn.unchecked_transaction()?;
    for e in entries {
        upsert_result(&tx, &e.assessment_id, &e.student_id, e.converted_score)?;
    }
    tx.commit().map_err(StoreError::Commit)?;
    Ok(entries.len())
}
