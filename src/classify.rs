use serde::Serialize;

const EXAM_NAME_MARKERS: [&str; 3] = ["end of term", "final", "terminal"];

#[cfg(test)]
const CATEGORY_CONTINUOUS: &str = "continuous_assessment";
pub const CATEGORY_FINAL_EXAM: &str = "final_exam";

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub id: String,
    pub exam_type_id: Option<String>,
    pub category: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExamType {
    pub id: String,
    pub name: String,
    pub is_system: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClassificationSource {
    SystemExamType,
    Category,
    NameMarker,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub ca_ids: Vec<String>,
    pub exam_ids: Vec<String>,
    pub source: ClassificationSource,
}

type Resolver = fn(&[Assessment], &[ExamType]) -> Option<Classification>;

/// Tried in order; the first resolver that produces a non-empty exam set decides.
const RESOLVERS: [Resolver; 3] = [by_system_exam_type, by_category, by_name_marker];

fn has_exam_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    EXAM_NAME_MARKERS.iter().any(|m| lower.contains(m))
}

fn split<F>(assessments: &[Assessment], source: ClassificationSource, is_exam: F) -> Classification
where
    F: Fn(&Assessment) -> bool,
{
    let mut ca_ids = Vec::new();
    let mut exam_ids = Vec::new();
    for a in assessments {
        if is_exam(a) {
            exam_ids.push(a.id.clone());
        } else {
            ca_ids.push(a.id.clone());
        }
    }
    Classification {
        ca_ids,
        exam_ids,
        source,
    }
}

fn non_empty(c: Classification) -> Option<Classification> {
    if c.exam_ids.is_empty() {
        None
    } else {
        Some(c)
    }
}

/// The school's flagged end-of-term type; the first qualifying entry in catalog order.
pub fn end_of_term_type(exam_types: &[ExamType]) -> Option<&ExamType> {
    exam_types
        .iter()
        .find(|t| t.is_system && has_exam_marker(&t.name))
}

fn by_system_exam_type(assessments: &[Assessment], exam_types: &[ExamType]) -> Option<Classification> {
    let eot = end_of_term_type(exam_types)?;
    non_empty(split(assessments, ClassificationSource::SystemExamType, |a| {
        a.exam_type_id.as_deref() == Some(eot.id.as_str())
    }))
}

fn by_category(assessments: &[Assessment], _exam_types: &[ExamType]) -> Option<Classification> {
    non_empty(split(assessments, ClassificationSource::Category, |a| {
        a.category.as_deref() == Some(CATEGORY_FINAL_EXAM)
    }))
}

fn by_name_marker(assessments: &[Assessment], _exam_types: &[ExamType]) -> Option<Classification> {
    non_empty(split(assessments, ClassificationSource::NameMarker, |a| {
        a.category.as_deref() == Some(CATEGORY_FINAL_EXAM) || has_exam_marker(&a.name)
    }))
}

/// Split a subject's assessments into continuous-assessment and exam ids.
/// Never fails: when no resolver finds an exam, everything counts as CA.
pub fn classify(assessments: &[Assessment], exam_types: &[ExamType]) -> Classification {
    RESOLVERS
        .iter()
        .find_map(|resolve| resolve(assessments, exam_types))
        .unwrap_or_else(|| split(assessments, ClassificationSource::Default, |_| false))
}
