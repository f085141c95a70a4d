use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::aggregate::{aggregate, header_totals};
use crate::classify::{classify, Classification, ClassificationSource};
use crate::config::EngineConfig;
use crate::grading::{grade_for, overall_remark, validate_bands, BandIssue, GradeBand};
use crate::ranking::{ordinal, rank_by, RankMode};
use crate::sources::{EnrolledStudent, SchoolData, Subject};
use crate::store::{AcademicPeriod, DetailRow, DetailScores, StoreError, TermReportHeader, TermReportStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no active students found in class {class_id}")]
    NoActiveEnrollments { class_id: String },
    #[error("no subjects found for school {school_id}")]
    NoSubjects { school_id: String },
    #[error("a term report batch is already running for class {class_id}")]
    BatchInProgress { class_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NoActiveEnrollments { .. } => "no_active_students",
            EngineError::NoSubjects { .. } => "no_subjects",
            EngineError::BatchInProgress { .. } => "batch_in_progress",
            EngineError::Store(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub school_id: String,
    pub class_id: String,
    pub period: AcademicPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStep {
    EnsureHeader,
    EnsureDetails,
    LoadAssessments,
    LoadResults,
    UpsertDetail,
    UpdateHeaderTotals,
    Deadline,
    RankOverall,
    RankSubject,
    RankBatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub student_id: String,
    pub subject_id: Option<String>,
    pub step: BatchStep,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub student_id: String,
    pub student_name: String,
    pub term_report_id: String,
    pub total_marks: f64,
    pub average_score: f64,
    pub subjects_with_scores: usize,
    pub failed_subjects: usize,
}

/// How one subject's assessments were split for this run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectClassification {
    pub subject_id: String,
    pub source: ClassificationSource,
    pub ca_count: usize,
    pub exam_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingSummary {
    pub mode: &'static str,
    pub overall_ranked: usize,
    pub subjects_ranked: usize,
    pub batches_ranked: usize,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub run_id: String,
    pub attempted_count: usize,
    pub updated_count: usize,
    pub failed_count: usize,
    pub deadline_exceeded: bool,
    pub per_student_summaries: Vec<StudentSummary>,
    pub failures: Vec<ItemFailure>,
    pub band_issues: Vec<BandIssue>,
    pub classifications: Vec<SubjectClassification>,
    pub ranking: RankingSummary,
}

struct SubjectPlan {
    subject: Subject,
    classification: Result<Classification, String>,
}

/// Aggregate, grade and rank every active student of a class for one period.
///
/// Fatal input problems (empty roster, empty subject catalog) abort before any
/// write. Everything else is recorded per student/subject and the run carries
/// on; ranking always runs over whatever was aggregated.
pub fn run_batch<D, S>(
    data: &D,
    store: &S,
    req: &BatchRequest,
    config: &EngineConfig,
) -> Result<BatchSummary, EngineError>
where
    D: SchoolData,
    S: TermReportStore,
{
    let run_id = Uuid::new_v4().to_string();
    let span = info_span!(
        "term_report_batch",
        run_id = %run_id,
        class_id = %req.class_id,
        year = %req.period.academic_year_id,
        term = %req.period.academic_term_id
    );
    let _enter = span.enter();

    let stale_after = std::time::Duration::from_millis(config.lock_stale_after_ms);
    if !store.acquire_run_lock(&req.class_id, &req.period, &run_id, stale_after)? {
        warn!("another run holds the lock");
        return Err(EngineError::BatchInProgress {
            class_id: req.class_id.clone(),
        });
    }

    let result = run_locked(data, store, req, config, &run_id);

    if let Err(e) = store.release_run_lock(&req.class_id, &req.period, &run_id) {
        warn!(error = %e, "failed to release run lock");
    }
    result
}

fn run_locked<D, S>(
    data: &D,
    store: &S,
    req: &BatchRequest,
    config: &EngineConfig,
    run_id: &str,
) -> Result<BatchSummary, EngineError>
where
    D: SchoolData,
    S: TermReportStore,
{
    let started = Instant::now();
    let deadline = config.deadline();

    let roster = data.list_active_enrollments(&req.class_id)?;
    if roster.is_empty() {
        return Err(EngineError::NoActiveEnrollments {
            class_id: req.class_id.clone(),
        });
    }
    let subjects = data.list_subjects(&req.school_id)?;
    if subjects.is_empty() {
        return Err(EngineError::NoSubjects {
            school_id: req.school_id.clone(),
        });
    }
    let bands = data.list_grade_bands(&req.school_id)?;
    let band_issues = validate_bands(&bands);
    for issue in &band_issues {
        warn!(?issue, "grade band configuration issue");
    }
    let exam_types = data.list_exam_types(&req.school_id)?;
    info!(
        students = roster.len(),
        subjects = subjects.len(),
        bands = bands.len(),
        "batch started"
    );

    // Classification depends only on the subject, not the student.
    let plans: Vec<SubjectPlan> = subjects
        .iter()
        .map(|subject| {
            let classification = data
                .list_assessments(&subject.id, &req.class_id, &req.period)
                .map(|assessments| {
                    if assessments.is_empty() {
                        warn!(subject_id = %subject.id, "no assessments for subject");
                    }
                    classify(&assessments, &exam_types)
                })
                .map_err(|e| e.to_string());
            if let Ok(c) = &classification {
                debug!(
                    subject_id = %subject.id,
                    source = ?c.source,
                    ca = c.ca_ids.len(),
                    exam = c.exam_ids.len(),
                    "classified assessments"
                );
            }
            SubjectPlan {
                subject: subject.clone(),
                classification,
            }
        })
        .collect();
    let subject_ids: Vec<String> = subjects.iter().map(|s| s.id.clone()).collect();
    let classifications: Vec<SubjectClassification> = plans
        .iter()
        .filter_map(|p| {
            p.classification.as_ref().ok().map(|c| SubjectClassification {
                subject_id: p.subject.id.clone(),
                source: c.source,
                ca_count: c.ca_ids.len(),
                exam_count: c.exam_ids.len(),
            })
        })
        .collect();

    let mut failures: Vec<ItemFailure> = Vec::new();
    let mut summaries: Vec<StudentSummary> = Vec::new();
    let mut deadline_exceeded = false;

    for student in &roster {
        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                if !deadline_exceeded {
                    warn!(elapsed_ms = started.elapsed().as_millis() as u64, "batch deadline exceeded");
                }
                deadline_exceeded = true;
                failures.push(ItemFailure {
                    student_id: student.student_id.clone(),
                    subject_id: None,
                    step: BatchStep::Deadline,
                    reason: "batch deadline exceeded before the student was processed".to_string(),
                });
                continue;
            }
        }

        if let Some(summary) = process_student(
            data,
            store,
            student,
            &req.period,
            &plans,
            &subject_ids,
            &bands,
            config,
            &mut failures,
        ) {
            summaries.push(summary);
        }
    }

    let ranking = rank_class(data, store, &roster, &subjects, &req.period, config, &mut failures);

    // Batch ranking may touch members of other classes; only this roster is counted.
    let on_roster: HashSet<&str> = roster.iter().map(|s| s.student_id.as_str()).collect();
    let failed_students: HashSet<&str> = failures
        .iter()
        .map(|f| f.student_id.as_str())
        .filter(|id| on_roster.contains(id))
        .collect();
    let updated_count = summaries
        .iter()
        .filter(|s| !failed_students.contains(s.student_id.as_str()))
        .count();

    info!(
        updated = updated_count,
        failed = failed_students.len(),
        failures = failures.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );

    Ok(BatchSummary {
        run_id: run_id.to_string(),
        attempted_count: roster.len(),
        updated_count,
        failed_count: failed_students.len(),
        deadline_exceeded,
        per_student_summaries: summaries,
        failures,
        band_issues,
        classifications,
        ranking,
    })
}

fn record(failures: &mut Vec<ItemFailure>, student_id: &str, subject_id: Option<&str>, step: BatchStep, reason: String) {
    warn!(student_id, subject_id, ?step, %reason, "item failed");
    failures.push(ItemFailure {
        student_id: student_id.to_string(),
        subject_id: subject_id.map(str::to_string),
        step,
        reason,
    });
}

#[allow(clippy::too_many_arguments)]
fn process_student<D, S>(
    data: &D,
    store: &S,
    student: &EnrolledStudent,
    period: &AcademicPeriod,
    plans: &[SubjectPlan],
    subject_ids: &[String],
    bands: &[GradeBand],
    config: &EngineConfig,
    failures: &mut Vec<ItemFailure>,
) -> Option<StudentSummary>
where
    D: SchoolData,
    S: TermReportStore,
{
    let sid = student.student_id.as_str();
    let header = match store.ensure_header(sid, period) {
        Ok(h) => h,
        Err(e) => {
            record(failures, sid, None, BatchStep::EnsureHeader, e.to_string());
            return None;
        }
    };

    match store.ensure_details_for_all_subjects(&header.id, subject_ids) {
        Ok(0) => {}
        Ok(n) => debug!(student_id = sid, created = n, "filled missing subject rows"),
        Err(e) => record(failures, sid, None, BatchStep::EnsureDetails, e.to_string()),
    }

    let mut totals: Vec<f64> = Vec::with_capacity(plans.len());
    let mut failed_subjects = 0_usize;
    for plan in plans {
        let subject_id = plan.subject.id.as_str();
        let classification = match &plan.classification {
            Ok(c) => c,
            Err(reason) => {
                record(failures, sid, Some(subject_id), BatchStep::LoadAssessments, reason.clone());
                failed_subjects += 1;
                continue;
            }
        };

        let mut wanted = classification.ca_ids.clone();
        wanted.extend(classification.exam_ids.iter().cloned());
        let results = match data.list_results(sid, &wanted) {
            Ok(r) => r,
            Err(e) => {
                record(failures, sid, Some(subject_id), BatchStep::LoadResults, e.to_string());
                failed_subjects += 1;
                continue;
            }
        };

        let score = aggregate(classification, &results);
        let grade = grade_for(score.total_score, bands);
        let scores = DetailScores {
            class_score: score.class_score,
            exam_score: score.exam_score,
            total_score: score.total_score,
            grade_id: grade.grade_id,
        };
        if let Err(e) = store.upsert_detail_scores(&header.id, subject_id, &scores) {
            record(failures, sid, Some(subject_id), BatchStep::UpsertDetail, e.to_string());
            failed_subjects += 1;
            continue;
        }
        debug!(
            student_id = sid,
            subject_id,
            subject = %plan.subject.name,
            class_score = score.class_score,
            exam_score = score.exam_score,
            total = score.total_score,
            grade = %grade.grade,
            "subject scored"
        );
        totals.push(score.total_score);
    }

    let header_totals = header_totals(totals, config.average_decimals);
    if let Err(e) = store.update_header_totals(&header.id, header_totals.total_marks, header_totals.average_score) {
        record(failures, sid, None, BatchStep::UpdateHeaderTotals, e.to_string());
        return None;
    }

    Some(StudentSummary {
        student_id: student.student_id.clone(),
        student_name: student.student_name.clone(),
        term_report_id: header.id,
        total_marks: header_totals.total_marks,
        average_score: header_totals.average_score,
        subjects_with_scores: header_totals.subjects_with_scores,
        failed_subjects,
    })
}

fn rank_class<D, S>(
    data: &D,
    store: &S,
    roster: &[EnrolledStudent],
    subjects: &[Subject],
    period: &AcademicPeriod,
    config: &EngineConfig,
    failures: &mut Vec<ItemFailure>,
) -> RankingSummary
where
    D: SchoolData,
    S: TermReportStore,
{
    let mode = config.rank_mode;
    let mut summary = RankingSummary {
        mode: mode.as_str(),
        ..RankingSummary::default()
    };
    let student_ids: Vec<String> = roster.iter().map(|s| s.student_id.clone()).collect();

    let headers = match store.list_headers(&student_ids, period) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "overall ranking skipped");
            summary.skipped.push(format!("overall: {}", e));
            return summary;
        }
    };
    if headers.is_empty() {
        summary.skipped.push("overall: no term reports".to_string());
        return summary;
    }

    let ranks = rank_by(&headers, mode, |h| h.average_score);
    for (header, rank) in headers.iter().zip(ranks) {
        match store.set_rank(&header.id, &ordinal(rank), overall_remark(header.average_score)) {
            Ok(()) => summary.overall_ranked += 1,
            Err(e) => record(failures, &header.student_id, None, BatchStep::RankOverall, e.to_string()),
        }
    }

    let owners = owners_of(&headers);
    let report_ids: Vec<String> = headers.iter().map(|h| h.id.clone()).collect();
    match store.list_details(&report_ids) {
        Ok(details) => {
            let by_subject = group_by_subject(details);
            for subject in subjects {
                match by_subject.get(subject.id.as_str()) {
                    Some(rows) => {
                        let failed = write_positions(rows, mode, |id, pos| {
                            store.set_subject_position(id, pos.unwrap_or(0))
                        });
                        if failed.is_empty() {
                            summary.subjects_ranked += 1;
                        }
                        record_position_failures(failures, &owners, failed, BatchStep::RankSubject);
                    }
                    None => summary.skipped.push(format!("subject {}: no detail rows", subject.id)),
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "subject ranking skipped");
            summary.skipped.push(format!("subjects: {}", e));
        }
    }

    if config.rank_batches {
        summary.batches_ranked = rank_batches(data, store, &student_ids, period, mode, &mut summary.skipped, failures);
    }

    info!(
        overall = summary.overall_ranked,
        subjects = summary.subjects_ranked,
        batches = summary.batches_ranked,
        "ranking complete"
    );
    summary
}

fn rank_batches<D, S>(
    data: &D,
    store: &S,
    student_ids: &[String],
    period: &AcademicPeriod,
    mode: RankMode,
    skipped: &mut Vec<String>,
    failures: &mut Vec<ItemFailure>,
) -> usize
where
    D: SchoolData,
    S: TermReportStore,
{
    let batches = match data.list_active_batches(student_ids) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "batch ranking skipped");
            skipped.push(format!("batches: {}", e));
            return 0;
        }
    };

    let mut ranked = 0_usize;
    for batch_id in batches {
        let loaded = data
            .list_active_batch_members(&batch_id)
            .and_then(|members| store.list_headers(&members, period))
            .and_then(|headers| {
                let ids: Vec<String> = headers.iter().map(|h| h.id.clone()).collect();
                store.list_details(&ids).map(|details| (owners_of(&headers), details))
            });
        match loaded {
            Ok((_, details)) if details.is_empty() => {
                skipped.push(format!("batch {}: no detail rows", batch_id));
            }
            Ok((owners, details)) => {
                let mut clean = true;
                for rows in group_by_subject(details).values() {
                    let failed = write_positions(rows, mode, |id, pos| store.set_batch_position(id, pos));
                    clean &= failed.is_empty();
                    record_position_failures(failures, &owners, failed, BatchStep::RankBatch);
                }
                if clean {
                    ranked += 1;
                }
            }
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "batch ranking failed");
                skipped.push(format!("batch {}: {}", batch_id, e));
            }
        }
    }
    ranked
}

/// Term report id to student id.
fn owners_of(headers: &[TermReportHeader]) -> HashMap<String, String> {
    headers
        .iter()
        .map(|h| (h.id.clone(), h.student_id.clone()))
        .collect()
}

fn record_position_failures(
    failures: &mut Vec<ItemFailure>,
    owners: &HashMap<String, String>,
    failed: Vec<(&DetailRow, StoreError)>,
    step: BatchStep,
) {
    for (row, e) in failed {
        let student_id = owners
            .get(&row.term_report_id)
            .map(String::as_str)
            .unwrap_or(row.term_report_id.as_str());
        record(failures, student_id, Some(row.subject_id.as_str()), step, e.to_string());
    }
}

fn group_by_subject(details: Vec<DetailRow>) -> BTreeMap<String, Vec<DetailRow>> {
    let mut grouped: BTreeMap<String, Vec<DetailRow>> = BTreeMap::new();
    for d in details {
        grouped.entry(d.subject_id.clone()).or_default().push(d);
    }
    grouped
}

/// Rank rows with a positive total; the rest are written as unranked (`None`).
/// Returns the rows whose write failed.
fn write_positions<F>(rows: &[DetailRow], mode: RankMode, mut write: F) -> Vec<(&DetailRow, StoreError)>
where
    F: FnMut(&str, Option<u32>) -> Result<(), StoreError>,
{
    let (scored, unscored): (Vec<&DetailRow>, Vec<&DetailRow>) = rows
        .iter()
        .partition(|d| d.total_score.is_finite() && d.total_score > 0.0);
    let ranks = rank_by(&scored, mode, |d| d.total_score);
    let mut positions: HashMap<&str, Option<u32>> = HashMap::new();
    for (d, rank) in scored.iter().zip(ranks) {
        positions.insert(d.id.as_str(), Some(rank));
    }
    for d in unscored {
        positions.insert(d.id.as_str(), None);
    }
    let mut failed = Vec::new();
    for d in rows {
        let pos = positions.get(d.id.as_str()).copied().flatten();
        if let Err(e) = write(&d.id, pos) {
            failed.push((d, e));
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::school;
    use crate::store::SqliteTermReportStore;
    use crate::sources::SqliteSchoolData;
    use rusqlite::Connection;
    use std::cell::Cell;
    use std::time::Duration;

    fn period() -> AcademicPeriod {
        AcademicPeriod {
            academic_year_id: "2025".to_string(),
            academic_term_id: "t1".to_string(),
        }
    }

    fn request() -> BatchRequest {
        BatchRequest {
            school_id: "sch".to_string(),
            class_id: "c1".to_string(),
            period: period(),
        }
    }

    /// Two students, Math and English, bands A>=80 / B>=60 / F<60, one CA and
    /// one exam per subject.
    fn seeded() -> Connection {
        let conn = db::open_in_memory().expect("open");
        school::create_school(&conn, Some("sch"), "Test School").expect("school");
        school::create_class(&conn, Some("c1"), "sch", "Basic 6").expect("class");
        for (id, first) in [("s1", "Ama"), ("s2", "Kofi")] {
            school::create_student(
                &conn,
                &school::NewStudent {
                    id: Some(id.to_string()),
                    school_id: "sch".to_string(),
                    first_name: first.to_string(),
                    last_name: "Mensah".to_string(),
                    student_no: None,
                    class_id: Some("c1".to_string()),
                    batch_id: Some("b1".to_string()),
                },
            )
            .expect("student");
        }
        school::create_subject(&conn, Some("math"), "sch", "Mathematics").expect("math");
        school::create_subject(&conn, Some("eng"), "sch", "English").expect("eng");
        school::create_exam_type(&conn, Some("eot"), "sch", "End of Term", true).expect("exam type");
        school::replace_grade_bands(
            &conn,
            "sch",
            &[
                school::NewBand::new("A", 80.0, 100.0, "Excellent"),
                school::NewBand::new("B", 60.0, 79.99, "Good"),
                school::NewBand::new("F", 0.0, 59.99, "Fail"),
            ],
        )
        .expect("bands");
        for subject in ["math", "eng"] {
            let ca = school::NewAssessment {
                id: Some(format!("{}-ca", subject)),
                subject_id: subject.to_string(),
                class_id: "c1".to_string(),
                period: period(),
                exam_type_id: None,
                category: Some("continuous_assessment".to_string()),
                name: "Class work".to_string(),
            };
            school::create_assessment(&conn, &ca).expect("ca");
            let exam = school::NewAssessment {
                id: Some(format!("{}-exam", subject)),
                exam_type_id: Some("eot".to_string()),
                category: None,
                name: "Paper".to_string(),
                ..ca
            };
            school::create_assessment(&conn, &exam).expect("exam");
        }
        // s1: Math 30+55=85, English 20+50=70. s2: Math 20+40=60, English 25+35=60.
        let scores = [
            ("math-ca", "s1", 30.0),
            ("math-exam", "s1", 55.0),
            ("eng-ca", "s1", 20.0),
            ("eng-exam", "s1", 50.0),
            ("math-ca", "s2", 20.0),
            ("math-exam", "s2", 40.0),
            ("eng-ca", "s2", 25.0),
            ("eng-exam", "s2", 35.0),
        ];
        for (a, s, v) in scores {
            school::upsert_result(&conn, a, s, Some(v)).expect("result");
        }
        conn
    }

    fn run(conn: &Connection, config: &EngineConfig) -> BatchSummary {
        let data = SqliteSchoolData::new(conn);
        let store = SqliteTermReportStore::new(conn);
        run_batch(&data, &store, &request(), config).expect("batch")
    }

    fn detail(conn: &Connection, student: &str, subject: &str) -> (f64, f64, f64, i64, Option<String>) {
        conn.query_row(
            "SELECT d.class_score, d.exam_score, d.total_score, d.class_position, g.grade_name
             FROM term_report_details d
             JOIN term_reports r ON r.id = d.term_report_id
             LEFT JOIN grade_bands g ON g.id = d.grade_id
             WHERE r.student_id = ? AND d.subject_id = ?",
            (student, subject),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .expect("detail row")
    }

    fn header(conn: &Connection, student: &str) -> (f64, f64, String) {
        conn.query_row(
            "SELECT total_marks, average_score, rank FROM term_reports WHERE student_id = ?",
            [student],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .expect("header row")
    }

    fn remark(conn: &Connection, student: &str) -> Option<String> {
        conn.query_row(
            "SELECT overall_remark FROM term_reports WHERE student_id = ?",
            [student],
            |r| r.get(0),
        )
        .expect("remark")
    }

    fn snapshot(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare(
                "SELECT r.student_id, r.total_marks, r.average_score, r.rank,
                        d.subject_id, d.class_score, d.exam_score, d.total_score,
                        d.class_position, d.batch_position, d.grade_id, d.id, r.id
                 FROM term_reports r
                 JOIN term_report_details d ON d.term_report_id = r.id
                 ORDER BY r.student_id, d.subject_id",
            )
            .expect("prepare");
        stmt.query_map([], |r| {
            Ok(format!(
                "{}|{}|{}|{}|{}|{}|{}|{}|{}|{:?}|{:?}|{}|{}",
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, f64>(5)?,
                r.get::<_, f64>(6)?,
                r.get::<_, f64>(7)?,
                r.get::<_, i64>(8)?,
                r.get::<_, Option<i64>>(9)?,
                r.get::<_, Option<String>>(10)?,
                r.get::<_, String>(11)?,
                r.get::<_, String>(12)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .expect("rows")
    }

    #[test]
    fn end_to_end_scores_grades_and_ranks() {
        let conn = seeded();
        let summary = run(&conn, &EngineConfig::default());
        assert_eq!(summary.attempted_count, 2);
        assert_eq!(summary.updated_count, 2);
        assert!(summary.failures.is_empty());
        assert_eq!(summary.ranking.overall_ranked, 2);
        assert_eq!(summary.ranking.subjects_ranked, 2);

        assert_eq!(detail(&conn, "s1", "math"), (30.0, 55.0, 85.0, 1, Some("A".to_string())));
        assert_eq!(detail(&conn, "s1", "eng"), (20.0, 50.0, 70.0, 1, Some("B".to_string())));
        assert_eq!(detail(&conn, "s2", "math"), (20.0, 40.0, 60.0, 2, Some("B".to_string())));
        assert_eq!(detail(&conn, "s2", "eng"), (25.0, 35.0, 60.0, 2, Some("B".to_string())));

        assert_eq!(header(&conn, "s1"), (155.0, 77.5, "1st".to_string()));
        assert_eq!(header(&conn, "s2"), (120.0, 60.0, "2nd".to_string()));
        assert_eq!(
            remark(&conn, "s1").as_deref(),
            Some("Very good performance. Continue to work hard.")
        );
        assert_eq!(
            remark(&conn, "s2").as_deref(),
            Some("Good performance with room for improvement.")
        );
    }

    #[test]
    fn rerun_is_idempotent() {
        let conn = seeded();
        run(&conn, &EngineConfig::default());
        let first = snapshot(&conn);
        run(&conn, &EngineConfig::default());
        assert_eq!(snapshot(&conn), first);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM term_report_details", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 4);
        let locks: i64 = conn
            .query_row("SELECT COUNT(*) FROM batch_locks", [], |r| r.get(0))
            .expect("locks");
        assert_eq!(locks, 0);
    }

    #[test]
    fn zero_total_subjects_are_unranked_and_excluded_from_average() {
        let conn = seeded();
        school::create_subject(&conn, Some("sci"), "sch", "Science").expect("sci");
        run(&conn, &EngineConfig::default());
        let (_, _, total, position, grade) = detail(&conn, "s1", "sci");
        assert_eq!(total, 0.0);
        assert_eq!(position, 0);
        assert_eq!(grade.as_deref(), Some("F"));
        assert_eq!(header(&conn, "s1").1, 77.5);
    }

    #[test]
    fn ties_share_rank_and_mode_controls_gaps() {
        let conn = seeded();
        school::create_student(
            &conn,
            &school::NewStudent {
                id: Some("s3".to_string()),
                school_id: "sch".to_string(),
                first_name: "Esi".to_string(),
                last_name: "Owusu".to_string(),
                student_no: None,
                class_id: Some("c1".to_string()),
                batch_id: None,
            },
        )
        .expect("s3");
        // s3 mirrors s2 in Math (60) and has nothing in English.
        school::upsert_result(&conn, "math-ca", "s3", Some(20.0)).expect("r");
        school::upsert_result(&conn, "math-exam", "s3", Some(40.0)).expect("r");

        run(&conn, &EngineConfig::default());
        // Averages: s1 77.5, s2 60, s3 60.
        assert_eq!(header(&conn, "s2").2, "2nd");
        assert_eq!(header(&conn, "s3").2, "2nd");
        assert_eq!(detail(&conn, "s2", "math").3, 2);
        assert_eq!(detail(&conn, "s3", "math").3, 2);
        assert_eq!(detail(&conn, "s3", "eng").3, 0);

        school::upsert_result(&conn, "math-exam", "s3", Some(0.0)).expect("r");
        school::upsert_result(&conn, "eng-ca", "s3", Some(10.0)).expect("r");
        // s3 now: Math 20, English 10 → average 15, last.
        let standard = EngineConfig {
            rank_mode: RankMode::Standard,
            ..EngineConfig::default()
        };
        run(&conn, &standard);
        assert_eq!(header(&conn, "s3").2, "3rd");
        assert_eq!(detail(&conn, "s3", "math").3, 3);
    }

    #[test]
    fn fatal_inputs_abort_before_writes() {
        let conn = db::open_in_memory().expect("open");
        school::create_school(&conn, Some("sch"), "Empty").expect("school");
        school::create_class(&conn, Some("c1"), "sch", "Empty class").expect("class");
        let data = SqliteSchoolData::new(&conn);
        let store = SqliteTermReportStore::new(&conn);
        let err = run_batch(&data, &store, &request(), &EngineConfig::default()).expect_err("no roster");
        assert_eq!(err.code(), "no_active_students");

        let conn = seeded();
        conn.execute("DELETE FROM assessment_results", []).expect("clear results");
        conn.execute("DELETE FROM assessments", []).expect("clear assessments");
        conn.execute("DELETE FROM subjects", []).expect("clear subjects");
        let data = SqliteSchoolData::new(&conn);
        let store = SqliteTermReportStore::new(&conn);
        let err = run_batch(&data, &store, &request(), &EngineConfig::default()).expect_err("no subjects");
        assert!(matches!(err, EngineError::NoSubjects { .. }));
        let reports: i64 = conn
            .query_row("SELECT COUNT(*) FROM term_reports", [], |r| r.get(0))
            .expect("count");
        assert_eq!(reports, 0);
        let locks: i64 = conn
            .query_row("SELECT COUNT(*) FROM batch_locks", [], |r| r.get(0))
            .expect("locks");
        assert_eq!(locks, 0);
    }

    #[test]
    fn held_lock_rejects_second_run() {
        let conn = seeded();
        let store = SqliteTermReportStore::new(&conn);
        assert!(store
            .acquire_run_lock("c1", &period(), "other-run", Duration::from_secs(600))
            .expect("lock"));
        let data = SqliteSchoolData::new(&conn);
        let err = run_batch(&data, &store, &request(), &EngineConfig::default()).expect_err("locked");
        assert_eq!(err.code(), "batch_in_progress");
    }

    #[test]
    fn batch_positions_rank_across_batch_members() {
        let conn = seeded();
        run(&conn, &EngineConfig::default());
        let positions: Vec<(String, Option<i64>)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT r.student_id, d.batch_position
                     FROM term_report_details d JOIN term_reports r ON r.id = d.term_report_id
                     WHERE d.subject_id = 'math' ORDER BY r.student_id",
                )
                .expect("prepare");
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .expect("rows")
        };
        assert_eq!(
            positions,
            vec![("s1".to_string(), Some(1)), ("s2".to_string(), Some(2))]
        );

        let conn = seeded();
        let no_batches = EngineConfig {
            rank_batches: false,
            ..EngineConfig::default()
        };
        let summary = run(&conn, &no_batches);
        assert_eq!(summary.ranking.batches_ranked, 0);
    }

    #[test]
    fn expired_deadline_reports_every_student() {
        let conn = seeded();
        let data = SqliteSchoolData::new(&conn);
        let store = SqliteTermReportStore::new(&conn);
        let tiny = EngineConfig {
            batch_deadline_ms: 1,
            ..EngineConfig::default()
        };
        // The deadline clock starts inside the run; force expiry with a slow store.
        let slow = SlowStore {
            inner: &store,
            delay: Duration::from_millis(5),
        };
        let summary = run_batch(&data, &slow, &request(), &tiny).expect("batch");
        assert!(summary.deadline_exceeded);
        assert_eq!(summary.attempted_count, 2);
        assert!(summary
            .failures
            .iter()
            .any(|f| f.step == BatchStep::Deadline && f.student_id == "s2"));
        let locks: i64 = conn
            .query_row("SELECT COUNT(*) FROM batch_locks", [], |r| r.get(0))
            .expect("locks");
        assert_eq!(locks, 0);
    }

    /// Delegates to a real store, failing `upsert_detail_scores` for one
    /// (report, subject) pair.
    struct FlakyStore<'a> {
        inner: &'a SqliteTermReportStore<'a>,
        fail_report: Cell<Option<String>>,
        fail_student: &'static str,
        fail_subject: &'static str,
    }

    fn injected() -> StoreError {
        StoreError::Db(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("injected busy".to_string()),
        ))
    }

    impl TermReportStore for FlakyStore<'_> {
        fn ensure_header(&self, student_id: &str, period: &AcademicPeriod) -> Result<TermReportHeader, StoreError> {
            let h = self.inner.ensure_header(student_id, period)?;
            if student_id == self.fail_student {
                self.fail_report.set(Some(h.id.clone()));
            }
            Ok(h)
        }
        fn ensure_details_for_all_subjects(&self, id: &str, subjects: &[String]) -> Result<usize, StoreError> {
            self.inner.ensure_details_for_all_subjects(id, subjects)
        }
        fn upsert_detail_scores(&self, id: &str, subject_id: &str, scores: &DetailScores) -> Result<(), StoreError> {
            let target = self.fail_report.take();
            let hit = target.as_deref() == Some(id) && subject_id == self.fail_subject;
            self.fail_report.set(target);
            if hit {
                return Err(injected());
            }
            self.inner.upsert_detail_scores(id, subject_id, scores)
        }
        fn update_header_totals(&self, id: &str, total: f64, average: f64) -> Result<(), StoreError> {
            self.inner.update_header_totals(id, total, average)
        }
        fn list_headers(&self, ids: &[String], period: &AcademicPeriod) -> Result<Vec<TermReportHeader>, StoreError> {
            self.inner.list_headers(ids, period)
        }
        fn list_details(&self, ids: &[String]) -> Result<Vec<DetailRow>, StoreError> {
            self.inner.list_details(ids)
        }
        fn set_rank(&self, id: &str, label: &str, remark: &str) -> Result<(), StoreError> {
            self.inner.set_rank(id, label, remark)
        }
        fn set_subject_position(&self, id: &str, position: u32) -> Result<(), StoreError> {
            self.inner.set_subject_position(id, position)
        }
        fn set_batch_position(&self, id: &str, position: Option<u32>) -> Result<(), StoreError> {
            self.inner.set_batch_position(id, position)
        }
        fn acquire_run_lock(&self, c: &str, p: &AcademicPeriod, r: &str, s: Duration) -> Result<bool, StoreError> {
            self.inner.acquire_run_lock(c, p, r, s)
        }
        fn release_run_lock(&self, c: &str, p: &AcademicPeriod, r: &str) -> Result<(), StoreError> {
            self.inner.release_run_lock(c, p, r)
        }
    }

    struct SlowStore<'a> {
        inner: &'a SqliteTermReportStore<'a>,
        delay: Duration,
    }

    impl TermReportStore for SlowStore<'_> {
        fn ensure_header(&self, student_id: &str, period: &AcademicPeriod) -> Result<TermReportHeader, StoreError> {
            std::thread::sleep(self.delay);
            self.inner.ensure_header(student_id, period)
        }
        fn ensure_details_for_all_subjects(&self, id: &str, subjects: &[String]) -> Result<usize, StoreError> {
            self.inner.ensure_details_for_all_subjects(id, subjects)
        }
        fn upsert_detail_scores(&self, id: &str, subject_id: &str, scores: &DetailScores) -> Result<(), StoreError> {
            self.inner.upsert_detail_scores(id, subject_id, scores)
        }
        fn update_header_totals(&self, id: &str, total: f64, average: f64) -> Result<(), StoreError> {
            self.inner.update_header_totals(id, total, average)
        }
        fn list_headers(&self, ids: &[String], period: &AcademicPeriod) -> Result<Vec<TermReportHeader>, StoreError> {
            self.inner.list_headers(ids, period)
        }
        fn list_details(&self, ids: &[String]) -> Result<Vec<DetailRow>, StoreError> {
            self.inner.list_details(ids)
        }
        fn set_rank(&self, id: &str, label: &str, remark: &str) -> Result<(), StoreError> {
            self.inner.set_rank(id, label, remark)
        }
        fn set_subject_position(&self, id: &str, position: u32) -> Result<(), StoreError> {
            self.inner.set_subject_position(id, position)
        }
        fn set_batch_position(&self, id: &str, position: Option<u32>) -> Result<(), StoreError> {
            self.inner.set_batch_position(id, position)
        }
        fn acquire_run_lock(&self, c: &str, p: &AcademicPeriod, r: &str, s: Duration) -> Result<bool, StoreError> {
            self.inner.acquire_run_lock(c, p, r, s)
        }
        fn release_run_lock(&self, c: &str, p: &AcademicPeriod, r: &str) -> Result<(), StoreError> {
            self.inner.release_run_lock(c, p, r)
        }
    }

    #[test]
    fn one_failed_upsert_is_isolated() {
        let conn = seeded();
        let data = SqliteSchoolData::new(&conn);
        let real = SqliteTermReportStore::new(&conn);
        let flaky = FlakyStore {
            inner: &real,
            fail_report: Cell::new(None),
            fail_student: "s1",
            fail_subject: "eng",
        };
        let summary = run_batch(&data, &flaky, &request(), &EngineConfig::default()).expect("batch");

        assert_eq!(summary.failures.len(), 1);
        let f = &summary.failures[0];
        assert_eq!(f.student_id, "s1");
        assert_eq!(f.subject_id.as_deref(), Some("eng"));
        assert_eq!(f.step, BatchStep::UpsertDetail);
        assert_eq!(summary.updated_count, 1);
        assert_eq!(summary.failed_count, 1);

        // s1's Math row and all of s2's rows were still written.
        assert_eq!(detail(&conn, "s1", "math").2, 85.0);
        assert_eq!(detail(&conn, "s1", "eng").2, 0.0);
        assert_eq!(detail(&conn, "s2", "math").2, 60.0);
        assert_eq!(detail(&conn, "s2", "eng").2, 60.0);
        // Header totals cover the subjects that succeeded.
        assert_eq!(header(&conn, "s1").1, 85.0);
        let s1 = summary
            .per_student_summaries
            .iter()
            .find(|s| s.student_id == "s1")
            .expect("s1 summary");
        assert_eq!(s1.failed_subjects, 1);
    }

    /// Delegates to a real store; rank and subject-position writes always fail.
    struct RankingOutage<'a> {
        inner: &'a SqliteTermReportStore<'a>,
    }

    impl TermReportStore for RankingOutage<'_> {
        fn ensure_header(&self, student_id: &str, period: &AcademicPeriod) -> Result<TermReportHeader, StoreError> {
            self.inner.ensure_header(student_id, period)
        }
        fn ensure_details_for_all_subjects(&self, id: &str, subjects: &[String]) -> Result<usize, StoreError> {
            self.inner.ensure_details_for_all_subjects(id, subjects)
        }
        fn upsert_detail_scores(&self, id: &str, subject_id: &str, scores: &DetailScores) -> Result<(), StoreError> {
            self.inner.upsert_detail_scores(id, subject_id, scores)
        }
        fn update_header_totals(&self, id: &str, total: f64, average: f64) -> Result<(), StoreError> {
            self.inner.update_header_totals(id, total, average)
        }
        fn list_headers(&self, ids: &[String], period: &AcademicPeriod) -> Result<Vec<TermReportHeader>, StoreError> {
            self.inner.list_headers(ids, period)
        }
        fn list_details(&self, ids: &[String]) -> Result<Vec<DetailRow>, StoreError> {
            self.inner.list_details(ids)
        }
        fn set_rank(&self, _id: &str, _label: &str, _remark: &str) -> Result<(), StoreError> {
            Err(injected())
        }
        fn set_subject_position(&self, _id: &str, _position: u32) -> Result<(), StoreError> {
            Err(injected())
        }
        fn set_batch_position(&self, id: &str, position: Option<u32>) -> Result<(), StoreError> {
            self.inner.set_batch_position(id, position)
        }
        fn acquire_run_lock(&self, c: &str, p: &AcademicPeriod, r: &str, s: Duration) -> Result<bool, StoreError> {
            self.inner.acquire_run_lock(c, p, r, s)
        }
        fn release_run_lock(&self, c: &str, p: &AcademicPeriod, r: &str) -> Result<(), StoreError> {
            self.inner.release_run_lock(c, p, r)
        }
    }

    #[test]
    fn failed_ranking_writes_are_reported() {
        let conn = seeded();
        let data = SqliteSchoolData::new(&conn);
        let real = SqliteTermReportStore::new(&conn);
        let outage = RankingOutage { inner: &real };
        let summary = run_batch(&data, &outage, &request(), &EngineConfig::default()).expect("batch");

        assert_eq!(summary.ranking.overall_ranked, 0);
        assert_eq!(summary.ranking.subjects_ranked, 0);
        assert_eq!(summary.ranking.batches_ranked, 1);
        assert!(summary.ranking.skipped.is_empty());

        let mut overall: Vec<&str> = summary
            .failures
            .iter()
            .filter(|f| f.step == BatchStep::RankOverall)
            .map(|f| {
                assert_eq!(f.subject_id, None);
                f.student_id.as_str()
            })
            .collect();
        overall.sort_unstable();
        assert_eq!(overall, vec!["s1", "s2"]);

        let mut positions: Vec<(&str, &str)> = summary
            .failures
            .iter()
            .filter(|f| f.step == BatchStep::RankSubject)
            .map(|f| (f.student_id.as_str(), f.subject_id.as_deref().unwrap_or("")))
            .collect();
        positions.sort_unstable();
        assert_eq!(
            positions,
            vec![("s1", "eng"), ("s1", "math"), ("s2", "eng"), ("s2", "math")]
        );
        assert!(summary.failures.iter().all(|f| f.reason.contains("injected busy")));
        assert_eq!(summary.failures.len(), 6);
        assert_eq!(summary.failed_count, 2);
        assert_eq!(summary.updated_count, 0);

        // Scores landed; nothing rank-related did.
        assert_eq!(header(&conn, "s1"), (155.0, 77.5, "N/A".to_string()));
        assert_eq!(remark(&conn, "s1"), None);
        assert_eq!(detail(&conn, "s1", "math").3, 0);
    }
}
