use rusqlite::{Connection, OptionalExtension};

use super::error::{ok, HandlerErr};
use super::types::{AppState, Request};
use crate::store::AcademicPeriod;

/// Finish a handler: `Ok` becomes a success envelope, `Err` an error one.
pub fn respond(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.trim().to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))
}

/// `not_found` unless `sql` (a `SELECT 1 ... WHERE id = ?`) returns a row.
pub fn require_row(conn: &Connection, sql: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    let found = conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    match found {
        Some(_) => Ok(()),
        None => Err(HandlerErr::new("not_found", format!("{} not found", what))
            .with_details(serde_json::json!({ "id": id }))),
    }
}

pub fn require_school(conn: &Connection, school_id: &str) -> Result<(), HandlerErr> {
    require_row(conn, "SELECT 1 FROM schools WHERE id = ?", school_id, "school")
}

pub fn period_from_params(params: &serde_json::Value) -> Result<AcademicPeriod, HandlerErr> {
    Ok(AcademicPeriod {
        academic_year_id: get_required_str(params, "academicYearId")?,
        academic_term_id: get_required_str(params, "academicTermId")?,
    })
}
