use serde::Serialize;

pub const UNGRADED_LABEL: &str = "NG";
pub const UNGRADED_REMARK: &str = "Not Graded";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub grade_id: String,
    pub min_score: f64,
    pub max_score: f64,
    pub grade_name: String,
    pub interpretation: Option<String>,
}

impl GradeBand {
    fn contains(&self, score: f64) -> bool {
        self.min_score <= score && score <= self.max_score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeInfo {
    pub grade_id: Option<String>,
    pub grade: String,
    pub remark: String,
}

impl GradeInfo {
    pub fn ungraded() -> Self {
        Self {
            grade_id: None,
            grade: UNGRADED_LABEL.to_string(),
            remark: UNGRADED_REMARK.to_string(),
        }
    }

    fn from_band(band: &GradeBand) -> Self {
        Self {
            grade_id: Some(band.grade_id.clone()),
            grade: band.grade_name.clone(),
            remark: band.interpretation.clone().unwrap_or_default(),
        }
    }
}

/// Resolve a score against a school's bands.
///
/// Bands are tried in the given order and the first one containing the score
/// wins, so overlapping configurations are order-dependent. A score that falls
/// in a gap between two bands (59.9 between `[0,59]` and `[60,79]`) takes the
/// lower band. Anything below the lowest band or above the highest one is
/// ungraded.
pub fn grade_for(score: f64, bands: &[GradeBand]) -> GradeInfo {
    if !score.is_finite() {
        return GradeInfo::ungraded();
    }
    if let Some(band) = bands.iter().find(|b| b.contains(score)) {
        return GradeInfo::from_band(band);
    }

    let below = bands
        .iter()
        .filter(|b| b.min_score <= score)
        .max_by(|a, b| a.min_score.total_cmp(&b.min_score));
    let has_band_above = bands.iter().any(|b| b.min_score > score);
    match below {
        Some(band) if has_band_above => GradeInfo::from_band(band),
        _ => GradeInfo::ungraded(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum BandIssue {
    Inverted { grade_name: String },
    Overlap { first: String, second: String },
    Gap { below: String, above: String },
}

/// Configuration problems worth surfacing; none of them stop grading.
pub fn validate_bands(bands: &[GradeBand]) -> Vec<BandIssue> {
    let mut issues = Vec::new();
    for b in bands {
        if b.min_score > b.max_score {
            issues.push(BandIssue::Inverted {
                grade_name: b.grade_name.clone(),
            });
        }
    }

    let mut sorted: Vec<&GradeBand> = bands.iter().filter(|b| b.min_score <= b.max_score).collect();
    sorted.sort_by(|a, b| a.min_score.total_cmp(&b.min_score));
    for pair in sorted.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if hi.min_score <= lo.max_score {
            issues.push(BandIssue::Overlap {
                first: lo.grade_name.clone(),
                second: hi.grade_name.clone(),
            });
        } else if hi.min_score - lo.max_score > 1.0 {
            // Integer-bounded bands (0-59, 60-79) leave a sub-point gap that is expected.
            issues.push(BandIssue::Gap {
                below: lo.grade_name.clone(),
                above: hi.grade_name.clone(),
            });
        }
    }
    issues
}

/// Average-score floors for the report's overall remark, best first.
const OVERALL_REMARKS: [(f64, &str); 5] = [
    (80.0, "Excellent performance! Keep up the outstanding work."),
    (70.0, "Very good performance. Continue to work hard."),
    (60.0, "Good performance with room for improvement."),
    (50.0, "Satisfactory performance. More effort needed."),
    (40.0, "Fair performance. Needs significant improvement."),
];
const LOWEST_OVERALL_REMARK: &str = "Poor performance. Urgent attention and support required.";

pub fn overall_remark(average_score: f64) -> &'static str {
    OVERALL_REMARKS
        .iter()
        .find(|(floor, _)| average_score >= *floor)
        .map(|(_, remark)| *remark)
        .unwrap_or(LOWEST_OVERALL_REMARK)
}
