use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::grading::{UNGRADED_LABEL, UNGRADED_REMARK};
use crate::school::STATUS_ACTIVE;
use crate::store::{AcademicPeriod, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: String,
    pub subject_name: String,
    pub class_score: f64,
    pub exam_score: f64,
    pub total_score: f64,
    pub grade: String,
    pub remark: String,
    pub class_position: u32,
    pub batch_position: Option<u32>,
}

/// What a report renderer consumes for one student and period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTermReport {
    pub term_report_id: String,
    pub student_id: String,
    pub academic_year_id: String,
    pub academic_term_id: String,
    pub total_marks: f64,
    pub average_score: f64,
    pub rank: String,
    /// Set by the ranking pass; `None` until the first one runs.
    pub overall_remark: Option<String>,
    /// Active enrollments in the student's class, for "Nth out of N".
    pub total_students: u32,
    pub subjects: Vec<SubjectLine>,
}

pub fn student_term_report(
    conn: &Connection,
    student_id: &str,
    period: &AcademicPeriod,
) -> Result<Option<StudentTermReport>, StoreError> {
    let header = conn
        .query_row(
            "SELECT id, total_marks, average_score, rank, overall_remark
             FROM term_reports
             WHERE student_id = ? AND academic_year_id = ? AND academic_term_id = ?",
            (student_id, &period.academic_year_id, &period.academic_term_id),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, f64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((term_report_id, total_marks, average_score, rank, overall_remark)) = header else {
        return Ok(None);
    };

    let total_students: u32 = conn.query_row(
        "SELECT COUNT(*) FROM class_enrollments
         WHERE status = ?1 AND class_id = (
           SELECT class_id FROM class_enrollments
           WHERE student_id = ?2 AND status = ?1
           ORDER BY class_id LIMIT 1
         )",
        (STATUS_ACTIVE, student_id),
        |r| r.get(0),
    )?;

    // A grade id whose band was since removed reads as ungraded.
    let mut stmt = conn.prepare(
        "SELECT d.subject_id, s.name, d.class_score, d.exam_score, d.total_score,
                d.class_position, d.batch_position, g.grade_name, g.interpretation
         FROM term_report_details d
         JOIN subjects s ON s.id = d.subject_id
         LEFT JOIN grade_bands g ON g.id = d.grade_id
         WHERE d.term_report_id = ?
         ORDER BY s.sort_order, s.name",
    )?;
    let subjects = stmt
        .query_map([&term_report_id], |r| {
            let grade: Option<String> = r.get(7)?;
            let remark: Option<String> = r.get(8)?;
            let (grade, remark) = match grade {
                Some(g) => (g, remark.unwrap_or_default()),
                None => (UNGRADED_LABEL.to_string(), UNGRADED_REMARK.to_string()),
            };
            Ok(SubjectLine {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                class_score: r.get(2)?,
                exam_score: r.get(3)?,
                total_score: r.get(4)?,
                grade,
                remark,
                class_position: r.get(5)?,
                batch_position: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(StudentTermReport {
        term_report_id,
        student_id: student_id.to_string(),
        academic_year_id: period.academic_year_id.clone(),
        academic_term_id: period.academic_term_id.clone(),
        total_marks,
        average_score,
        rank,
        overall_remark,
        total_students,
        subjects,
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummaryRow {
    pub term_report_id: String,
    pub student_id: String,
    pub student_name: String,
    pub total_marks: f64,
    pub average_score: f64,
    pub rank: String,
    pub overall_remark: Option<String>,
}

/// Headers of a class's active students, best average first.
pub fn class_summary(
    conn: &Connection,
    class_id: &str,
    period: &AcademicPeriod,
) -> Result<Vec<ClassSummaryRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT r.id, s.id, s.first_name, s.last_name, r.total_marks, r.average_score, r.rank,
                r.overall_remark
         FROM class_enrollments e
         JOIN students s ON s.id = e.student_id
         JOIN term_reports r ON r.student_id = s.id
         WHERE e.class_id = ? AND e.status = ?
           AND r.academic_year_id = ? AND r.academic_term_id = ?
         ORDER BY r.average_score DESC, s.last_name, s.first_name",
    )?;
    let rows = stmt
        .query_map(
            (
                class_id,
                STATUS_ACTIVE,
                &period.academic_year_id,
                &period.academic_term_id,
            ),
            |r| {
                let first: String = r.get(2)?;
                let last: String = r.get(3)?;
                Ok(ClassSummaryRow {
                    term_report_id: r.get(0)?,
                    student_id: r.get(1)?,
                    student_name: format!("{} {}", first, last),
                    total_marks: r.get(4)?,
                    average_score: r.get(5)?,
                    rank: r.get(6)?,
                    overall_remark: r.get(7)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
