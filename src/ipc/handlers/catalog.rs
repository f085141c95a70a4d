use crate::grading::{validate_bands, GradeBand};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    get_opt_str, get_required_f64, get_required_str, period_from_params, require_db, require_row, require_school,
    respond,
};
use crate::ipc::types::{AppState, Request};
use crate::school::{self, NewAssessment, NewBand, ResultEntry};
use serde_json::{json, Value};

fn subjects_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let school_id = get_required_str(&req.params, "schoolId")?;
    let name = get_required_str(&req.params, "name")?;
    let id = get_opt_str(&req.params, "subjectId")?;
    require_school(conn, &school_id)?;
    let subject_id = school::create_subject(conn, id.as_deref(), &school_id, &name)
        .map_err(|e| HandlerErr::store("db_insert_failed", e).with_details(json!({ "table": "subjects" })))?;
    Ok(json!({ "subjectId": subject_id, "name": name }))
}

fn exam_types_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let school_id = get_required_str(&req.params, "schoolId")?;
    let name = get_required_str(&req.params, "name")?;
    let id = get_opt_str(&req.params, "examTypeId")?;
    let is_system = match req.params.get("isSystem") {
        None | Some(Value::Null) => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("isSystem must be a boolean"))?,
    };
    require_school(conn, &school_id)?;
    let exam_type_id = school::create_exam_type(conn, id.as_deref(), &school_id, &name, is_system)
        .map_err(|e| HandlerErr::store("db_insert_failed", e).with_details(json!({ "table": "exam_types" })))?;
    Ok(json!({ "examTypeId": exam_type_id, "name": name, "isSystem": is_system }))
}

fn parse_band(v: &Value, index: usize) -> Result<NewBand, HandlerErr> {
    let at = |e: HandlerErr| e.with_details(json!({ "index": index }));
    if !v.is_object() {
        return Err(at(HandlerErr::bad_params("each band must be an object")));
    }
    let min_score = get_required_f64(v, "minScore").map_err(at)?;
    let max_score = get_required_f64(v, "maxScore").map_err(at)?;
    Ok(NewBand {
        id: get_opt_str(v, "gradeId").map_err(at)?,
        grade_name: get_required_str(v, "gradeName").map_err(at)?,
        min_score,
        max_score,
        interpretation: get_opt_str(v, "interpretation").map_err(at)?,
    })
}

fn grade_bands_replace(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let school_id = get_required_str(&req.params, "schoolId")?;
    let Some(raw) = req.params.get("bands").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing bands"));
    };
    let bands = raw
        .iter()
        .enumerate()
        .map(|(i, v)| parse_band(v, i))
        .collect::<Result<Vec<_>, _>>()?;
    require_school(conn, &school_id)?;

    let ids = school::replace_grade_bands(conn, &school_id, &bands)
        .map_err(|e| HandlerErr::store("db_tx_failed", e))?;
    let stored: Vec<GradeBand> = bands
        .iter()
        .zip(&ids)
        .map(|(b, id)| GradeBand {
            grade_id: id.clone(),
            min_score: b.min_score,
            max_score: b.max_score,
            grade_name: b.grade_name.clone(),
            interpretation: b.interpretation.clone(),
        })
        .collect();
    Ok(json!({
        "gradeIds": ids,
        "issues": validate_bands(&stored)
    }))
}

fn assessments_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let assessment = NewAssessment {
        id: get_opt_str(p, "assessmentId")?,
        subject_id: get_required_str(p, "subjectId")?,
        class_id: get_required_str(p, "classId")?,
        period: period_from_params(p)?,
        exam_type_id: get_opt_str(p, "examTypeId")?,
        category: get_opt_str(p, "category")?,
        name: get_required_str(p, "name")?,
    };
    require_row(conn, "SELECT 1 FROM subjects WHERE id = ?", &assessment.subject_id, "subject")?;
    require_row(conn, "SELECT 1 FROM classes WHERE id = ?", &assessment.class_id, "class")?;
    if let Some(exam_type_id) = &assessment.exam_type_id {
        require_row(conn, "SELECT 1 FROM exam_types WHERE id = ?", exam_type_id, "exam type")?;
    }
    let assessment_id = school::create_assessment(conn, &assessment)
        .map_err(|e| HandlerErr::store("db_insert_failed", e).with_details(json!({ "table": "assessments" })))?;
    Ok(json!({ "assessmentId": assessment_id }))
}

fn results_upsert(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let Some(raw) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let mut entries = Vec::with_capacity(raw.len());
    for (i, v) in raw.iter().enumerate() {
        let at = |e: HandlerErr| e.with_details(json!({ "index": i }));
        let converted_score = match v.get("convertedScore") {
            None | Some(Value::Null) => None,
            Some(_) => Some(get_required_f64(v, "convertedScore").map_err(at)?),
        };
        entries.push(ResultEntry {
            assessment_id: get_required_str(v, "assessmentId").map_err(at)?,
            student_id: get_required_str(v, "studentId").map_err(at)?,
            converted_score,
        });
    }
    let written = school::upsert_results(conn, &entries).map_err(|e| HandlerErr::store("db_tx_failed", e))?;
    Ok(json!({ "upserted": written }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "subjects.create" => subjects_create(state, req),
        "examTypes.create" => exam_types_create(state, req),
        "gradeBands.replace" => grade_bands_replace(state, req),
        "assessments.create" => assessments_create(state, req),
        "results.upsert" => results_upsert(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
