use rusqlite::{params_from_iter, types::Value, Connection};

use crate::aggregate::AssessmentResult;
use crate::classify::{Assessment, ExamType};
use crate::grading::GradeBand;
use crate::store::{placeholders, AcademicPeriod, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledStudent {
    pub student_id: String,
    pub student_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub name: String,
}

/// Read-only view of the roster, catalog and assessment data a batch consumes.
pub trait SchoolData {
    fn list_active_enrollments(&self, class_id: &str) -> Result<Vec<EnrolledStudent>, StoreError>;
    fn list_subjects(&self, school_id: &str) -> Result<Vec<Subject>, StoreError>;
    fn list_exam_types(&self, school_id: &str) -> Result<Vec<ExamType>, StoreError>;
    fn list_grade_bands(&self, school_id: &str) -> Result<Vec<GradeBand>, StoreError>;
    fn list_assessments(
        &self,
        subject_id: &str,
        class_id: &str,
        period: &AcademicPeriod,
    ) -> Result<Vec<Assessment>, StoreError>;
    fn list_results(&self, student_id: &str, assessment_ids: &[String]) -> Result<Vec<AssessmentResult>, StoreError>;
    /// Active batches any of `student_ids` belongs to.
    fn list_active_batches(&self, student_ids: &[String]) -> Result<Vec<String>, StoreError>;
    fn list_active_batch_members(&self, batch_id: &str) -> Result<Vec<String>, StoreError>;
}

pub struct SqliteSchoolData<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSchoolData<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SchoolData for SqliteSchoolData<'_> {
    fn list_active_enrollments(&self, class_id: &str) -> Result<Vec<EnrolledStudent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.first_name, s.last_name
             FROM class_enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.class_id = ? AND e.status = 'active'
             ORDER BY s.last_name, s.first_name, s.id",
        )?;
        let rows = stmt.query_map([class_id], |r| {
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            Ok(EnrolledStudent {
                student_id: r.get(0)?,
                student_name: format!("{} {}", first, last),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_subjects(&self, school_id: &str) -> Result<Vec<Subject>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM subjects WHERE school_id = ? ORDER BY sort_order, name")?;
        let rows = stmt.query_map([school_id], |r| {
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_exam_types(&self, school_id: &str) -> Result<Vec<ExamType>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, is_system FROM exam_types WHERE school_id = ? ORDER BY sort_order",
        )?;
        let rows = stmt.query_map([school_id], |r| {
            Ok(ExamType {
                id: r.get(0)?,
                name: r.get(1)?,
                is_system: r.get::<_, i64>(2)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_grade_bands(&self, school_id: &str) -> Result<Vec<GradeBand>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, min_score, max_score, grade_name, interpretation
             FROM grade_bands
             WHERE school_id = ?
             ORDER BY sort_order",
        )?;
        let rows = stmt.query_map([school_id], |r| {
            Ok(GradeBand {
                grade_id: r.get(0)?,
                min_score: r.get(1)?,
                max_score: r.get(2)?,
                grade_name: r.get(3)?,
                interpretation: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_assessments(
        &self,
        subject_id: &str,
        class_id: &str,
        period: &AcademicPeriod,
    ) -> Result<Vec<Assessment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, exam_type_id, category, name
             FROM assessments
             WHERE subject_id = ? AND class_id = ? AND academic_year_id = ? AND academic_term_id = ?
             ORDER BY sort_order",
        )?;
        let rows = stmt.query_map(
            (
                subject_id,
                class_id,
                &period.academic_year_id,
                &period.academic_term_id,
            ),
            |r| {
                Ok(Assessment {
                    id: r.get(0)?,
                    exam_type_id: r.get(1)?,
                    category: r.get(2)?,
                    name: r.get(3)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_results(&self, student_id: &str, assessment_ids: &[String]) -> Result<Vec<AssessmentResult>, StoreError> {
        if assessment_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT assessment_id, converted_score
             FROM assessment_results
             WHERE student_id = ? AND assessment_id IN ({})",
            placeholders(assessment_ids.len())
        );
        let mut bind_values: Vec<Value> = Vec::with_capacity(assessment_ids.len() + 1);
        bind_values.push(Value::Text(student_id.to_string()));
        for id in assessment_ids {
            bind_values.push(Value::Text(id.clone()));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind_values), |r| {
            Ok(AssessmentResult {
                assessment_id: r.get(0)?,
                converted_score: r.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_active_batches(&self, student_ids: &[String]) -> Result<Vec<String>, StoreError> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT batch_id
             FROM batch_enrollments
             WHERE status = 'active' AND student_id IN ({})
             ORDER BY batch_id",
            placeholders(student_ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(student_ids.iter()), |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_active_batch_members(&self, batch_id: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id FROM batch_enrollments
             WHERE batch_id = ? AND status = 'active'
             ORDER BY student_id",
        )?;
        let rows = stmt.query_map([batch_id], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
