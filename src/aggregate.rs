use std::collections::HashSet;

use serde::Serialize;

use crate::classify::Classification;

#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentResult {
    pub assessment_id: String,
    pub converted_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScore {
    pub class_score: f64,
    pub exam_score: f64,
    pub total_score: f64,
}

/// Raw sums of converted scores. No weighting is applied: callers that want a
/// 30/70 split must store already-weighted converted scores.
pub fn aggregate(classification: &Classification, results: &[AssessmentResult]) -> SubjectScore {
    let ca: HashSet<&str> = classification.ca_ids.iter().map(String::as_str).collect();
    let exam: HashSet<&str> = classification.exam_ids.iter().map(String::as_str).collect();

    let mut class_score = 0.0_f64;
    let mut exam_score = 0.0_f64;
    for r in results {
        let v = r.converted_score.filter(|v| v.is_finite()).unwrap_or(0.0);
        if ca.contains(r.assessment_id.as_str()) {
            class_score += v;
        } else if exam.contains(r.assessment_id.as_str()) {
            exam_score += v;
        }
    }

    SubjectScore {
        class_score,
        exam_score,
        total_score: class_score + exam_score,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderTotals {
    pub total_marks: f64,
    pub average_score: f64,
    pub subjects_with_scores: usize,
}

pub fn round_to(x: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals.min(10) as i32);
    (x * factor).round() / factor
}

/// Subjects with a zero total are left out of the average so that subjects
/// nobody has assessed yet do not pull it down.
pub fn header_totals<I>(subject_totals: I, average_decimals: u32) -> HeaderTotals
where
    I: IntoIterator<Item = f64>,
{
    let mut total_marks = 0.0_f64;
    let mut subjects_with_scores = 0_usize;
    for t in subject_totals {
        if t > 0.0 {
            total_marks += t;
            subjects_with_scores += 1;
        }
    }
    let average_score = if subjects_with_scores > 0 {
        round_to(total_marks / subjects_with_scores as f64, average_decimals)
    } else {
        0.0
    };
    HeaderTotals {
        total_marks,
        average_score,
        subjects_with_scores,
    }
}
