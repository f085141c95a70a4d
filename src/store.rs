use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("commit failed: {0}")]
    Commit(#[source] rusqlite::Error),
    #[error("term report {0} missing after creation")]
    MissingReport(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Db(_) => "db_query_failed",
            StoreError::Commit(_) => "db_commit_failed",
            StoreError::MissingReport(_) => "not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AcademicPeriod {
    pub academic_year_id: String,
    pub academic_term_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TermReportHeader {
    pub id: String,
    pub student_id: String,
    pub total_marks: f64,
    pub average_score: f64,
    pub rank: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetailScores {
    pub class_score: f64,
    pub exam_score: f64,
    pub total_score: f64,
    pub grade_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetailRow {
    pub id: String,
    pub term_report_id: String,
    pub subject_id: String,
    pub total_score: f64,
}

/// Persistence contract for term reports. Every write is keyed by a natural
/// key so that re-running a batch updates rows instead of adding new ones.
pub trait TermReportStore {
    /// One header per (student, period); created with zero totals and rank `N/A`.
    fn ensure_header(&self, student_id: &str, period: &AcademicPeriod) -> Result<TermReportHeader, StoreError>;

    /// Insert zero-valued details for subjects the report lacks. Returns how many were added.
    fn ensure_details_for_all_subjects(&self, term_report_id: &str, subject_ids: &[String]) -> Result<usize, StoreError>;

    /// Write scores and grade; positions computed by earlier ranking passes are kept.
    fn upsert_detail_scores(&self, term_report_id: &str, subject_id: &str, scores: &DetailScores) -> Result<(), StoreError>;

    fn update_header_totals(&self, term_report_id: &str, total_marks: f64, average_score: f64) -> Result<(), StoreError>;

    fn list_headers(&self, student_ids: &[String], period: &AcademicPeriod) -> Result<Vec<TermReportHeader>, StoreError>;

    fn list_details(&self, term_report_ids: &[String]) -> Result<Vec<DetailRow>, StoreError>;

    /// Overall rank label and the remark that goes with the student's average.
    fn set_rank(&self, term_report_id: &str, rank_label: &str, overall_remark: &str) -> Result<(), StoreError>;

    fn set_subject_position(&self, detail_id: &str, position: u32) -> Result<(), StoreError>;

    fn set_batch_position(&self, detail_id: &str, position: Option<u32>) -> Result<(), StoreError>;

    /// Claim the (class, period) run slot. `false` means another live run holds it.
    fn acquire_run_lock(&self, class_id: &str, period: &AcademicPeriod, run_id: &str, stale_after: Duration) -> Result<bool, StoreError>;

    fn release_run_lock(&self, class_id: &str, period: &AcademicPeriod, run_id: &str) -> Result<(), StoreError>;
}

pub struct SqliteTermReportStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteTermReportStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

pub(crate) fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

impl TermReportStore for SqliteTermReportStore<'_> {
    fn ensure_header(&self, student_id: &str, period: &AcademicPeriod) -> Result<TermReportHeader, StoreError> {
        let now = now_stamp();
        self.conn.execute(
            "INSERT INTO term_reports(
               id, student_id, academic_year_id, academic_term_id,
               total_marks, average_score, rank, created_at, updated_at
             )
             VALUES(?, ?, ?, ?, 0, 0, 'N/A', ?, ?)
             ON CONFLICT(student_id, academic_year_id, academic_term_id) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                student_id,
                &period.academic_year_id,
                &period.academic_term_id,
                &now,
                &now,
            ),
        )?;
        self.conn
            .query_row(
                "SELECT id, student_id, total_marks, average_score, rank
                 FROM term_reports
                 WHERE student_id = ? AND academic_year_id = ? AND academic_term_id = ?",
                (student_id, &period.academic_year_id, &period.academic_term_id),
                |r| {
                    Ok(TermReportHeader {
                        id: r.get(0)?,
                        student_id: r.get(1)?,
                        total_marks: r.get(2)?,
                        average_score: r.get(3)?,
                        rank: r.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::MissingReport(student_id.to_string()))
    }

    fn ensure_details_for_all_subjects(&self, term_report_id: &str, subject_ids: &[String]) -> Result<usize, StoreError> {
        let existing: HashSet<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT subject_id FROM term_report_details WHERE term_report_id = ?")?;
            let rows = stmt.query_map([term_report_id], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<HashSet<_>, _>>()?
        };
        let missing: Vec<&String> = subject_ids.iter().filter(|s| !existing.contains(*s)).collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let now = now_stamp();
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0_usize;
        for subject_id in missing {
            inserted += tx.execute(
                "INSERT INTO term_report_details(
                   id, term_report_id, subject_id, class_score, exam_score, total_score,
                   class_position, batch_position, grade_id, created_at, updated_at
                 )
                 VALUES(?, ?, ?, 0, 0, 0, 0, NULL, NULL, ?, ?)
                 ON CONFLICT(term_report_id, subject_id) DO NOTHING",
                (Uuid::new_v4().to_string(), term_report_id, subject_id, &now, &now),
            )?;
        }
        tx.commit().map_err(StoreError::Commit)?;
        Ok(inserted)
    }

    fn upsert_detail_scores(&self, term_report_id: &str, subject_id: &str, scores: &DetailScores) -> Result<(), StoreError> {
        let now = now_stamp();
        self.conn.execute(
            "INSERT INTO term_report_details(
               id, term_report_id, subject_id, class_score, exam_score, total_score,
               class_position, batch_position, grade_id, created_at, updated_at
             )
             VALUES(?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?)
             ON CONFLICT(term_report_id, subject_id) DO UPDATE SET
               class_score = excluded.class_score,
               exam_score = excluded.exam_score,
               total_score = excluded.total_score,
               grade_id = excluded.grade_id,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                term_report_id,
                subject_id,
                scores.class_score,
                scores.exam_score,
                scores.total_score,
                &scores.grade_id,
                &now,
                &now,
            ),
        )?;
        Ok(())
    }

    fn update_header_totals(&self, term_report_id: &str, total_marks: f64, average_score: f64) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE term_reports SET total_marks = ?, average_score = ?, updated_at = ? WHERE id = ?",
            (total_marks, average_score, now_stamp(), term_report_id),
        )?;
        if changed == 0 {
            return Err(StoreError::MissingReport(term_report_id.to_string()));
        }
        Ok(())
    }

    fn list_headers(&self, student_ids: &[String], period: &AcademicPeriod) -> Result<Vec<TermReportHeader>, StoreError> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, student_id, total_marks, average_score, rank
             FROM term_reports
             WHERE academic_year_id = ? AND academic_term_id = ? AND student_id IN ({})
             ORDER BY student_id",
            placeholders(student_ids.len())
        );
        let mut bind_values: Vec<Value> = Vec::with_capacity(student_ids.len() + 2);
        bind_values.push(Value::Text(period.academic_year_id.clone()));
        bind_values.push(Value::Text(period.academic_term_id.clone()));
        for id in student_ids {
            bind_values.push(Value::Text(id.clone()));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind_values), |r| {
            Ok(TermReportHeader {
                id: r.get(0)?,
                student_id: r.get(1)?,
                total_marks: r.get(2)?,
                average_score: r.get(3)?,
                rank: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_details(&self, term_report_ids: &[String]) -> Result<Vec<DetailRow>, StoreError> {
        if term_report_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, term_report_id, subject_id, total_score
             FROM term_report_details
             WHERE term_report_id IN ({})
             ORDER BY subject_id, term_report_id",
            placeholders(term_report_ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(term_report_ids.iter()), |r| {
            Ok(DetailRow {
                id: r.get(0)?,
                term_report_id: r.get(1)?,
                subject_id: r.get(2)?,
                total_score: r.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn set_rank(&self, term_report_id: &str, rank_label: &str, overall_remark: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE term_reports SET rank = ?, overall_remark = ?, updated_at = ? WHERE id = ?",
            (rank_label, overall_remark, now_stamp(), term_report_id),
        )?;
        Ok(())
    }

    fn set_subject_position(&self, detail_id: &str, position: u32) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE term_report_details SET class_position = ? WHERE id = ?",
            (position, detail_id),
        )?;
        Ok(())
    }

    fn set_batch_position(&self, detail_id: &str, position: Option<u32>) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE term_report_details SET batch_position = ? WHERE id = ?",
            (position, detail_id),
        )?;
        Ok(())
    }

    fn acquire_run_lock(&self, class_id: &str, period: &AcademicPeriod, run_id: &str, stale_after: Duration) -> Result<bool, StoreError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let stale_before = now_ms.saturating_sub(i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX));
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM batch_locks
             WHERE class_id = ? AND academic_year_id = ? AND academic_term_id = ? AND started_at_ms < ?",
            (class_id, &period.academic_year_id, &period.academic_term_id, stale_before),
        )?;
        let inserted = tx.execute(
            "INSERT INTO batch_locks(class_id, academic_year_id, academic_term_id, run_id, started_at_ms)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(class_id, academic_year_id, academic_term_id) DO NOTHING",
            (class_id, &period.academic_year_id, &period.academic_term_id, run_id, now_ms),
        )?;
        tx.commit().map_err(StoreError::Commit)?;
        Ok(inserted == 1)
    }

    fn release_run_lock(&self, class_id: &str, period: &AcademicPeriod, run_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM batch_locks
             WHERE class_id = ? AND academic_year_id = ? AND academic_term_id = ? AND run_id = ?",
            (class_id, &period.academic_year_id, &period.academic_term_id, run_id),
        )?;
        Ok(())
    }
}
