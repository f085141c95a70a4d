use crate::config::{self, EngineConfig};
use crate::engine::{self, BatchRequest};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_required_str, period_from_params, require_db, require_row, require_school, respond};
use crate::ipc::types::{AppState, Request};
use crate::report;
use crate::sources::SqliteSchoolData;
use crate::store::SqliteTermReportStore;
use rusqlite::Connection;
use serde_json::{json, Value};

fn load_config(conn: &Connection) -> Result<EngineConfig, HandlerErr> {
    config::load(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn run_batch(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let batch = BatchRequest {
        school_id: get_required_str(&req.params, "schoolId")?,
        class_id: get_required_str(&req.params, "classId")?,
        period: period_from_params(&req.params)?,
    };
    require_school(conn, &batch.school_id)?;
    require_row(conn, "SELECT 1 FROM classes WHERE id = ?", &batch.class_id, "class")?;

    let mut cfg = load_config(conn)?;
    if let Some(overrides) = req.params.get("config").filter(|v| !v.is_null()) {
        cfg = cfg.merged(overrides).map_err(HandlerErr::bad_params)?;
    }

    let data = SqliteSchoolData::new(conn);
    let store = SqliteTermReportStore::new(conn);
    let summary = engine::run_batch(&data, &store, &batch, &cfg)?;
    serde_json::to_value(summary).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn term_report(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let period = period_from_params(&req.params)?;
    match report::student_term_report(conn, &student_id, &period)? {
        Some(r) => serde_json::to_value(r).map_err(|e| HandlerErr::new("internal", e.to_string())),
        None => Err(HandlerErr::new("not_found", "term report not found").with_details(json!({
            "studentId": student_id,
            "academicYearId": period.academic_year_id,
            "academicTermId": period.academic_term_id
        }))),
    }
}

fn class_summary(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = get_required_str(&req.params, "classId")?;
    let period = period_from_params(&req.params)?;
    require_row(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id, "class")?;
    let rows = report::class_summary(conn, &class_id, &period)?;
    Ok(json!({ "classId": class_id, "rows": rows }))
}

fn config_get(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let cfg = load_config(conn)?;
    Ok(json!({ "config": cfg }))
}

fn config_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let Some(patch) = req.params.get("config") else {
        return Err(HandlerErr::bad_params("missing config"));
    };
    let cfg = load_config(conn)?
        .merged(patch)
        .map_err(HandlerErr::bad_params)?;
    config::save(conn, &cfg).map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "config": cfg }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "reports.runBatch" => run_batch(state, req),
        "reports.termReport" => term_report(state, req),
        "reports.classSummary" => class_summary(state, req),
        "reports.config.get" => config_get(state),
        "reports.config.update" => config_update(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
