use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_opt_str, get_required_str, require_db, require_row, require_school, respond};
use crate::ipc::types::{AppState, Request};
use crate::school::{self, EnrollmentKind, NewStudent};
use serde_json::{json, Value};

fn schools_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = get_required_str(&req.params, "name")?;
    let id = get_opt_str(&req.params, "schoolId")?;
    let school_id = school::create_school(conn, id.as_deref(), &name)
        .map_err(|e| HandlerErr::store("db_insert_failed", e).with_details(json!({ "table": "schools" })))?;
    Ok(json!({ "schoolId": school_id, "name": name }))
}

fn classes_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let school_id = get_required_str(&req.params, "schoolId")?;
    let name = get_required_str(&req.params, "name")?;
    let id = get_opt_str(&req.params, "classId")?;
    require_school(conn, &school_id)?;
    let class_id = school::create_class(conn, id.as_deref(), &school_id, &name)
        .map_err(|e| HandlerErr::store("db_insert_failed", e).with_details(json!({ "table": "classes" })))?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn students_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let student = NewStudent {
        id: get_opt_str(p, "studentId")?,
        school_id: get_required_str(p, "schoolId")?,
        first_name: get_required_str(p, "firstName")?,
        last_name: get_required_str(p, "lastName")?,
        student_no: get_opt_str(p, "studentNo")?,
        class_id: get_opt_str(p, "classId")?,
        batch_id: get_opt_str(p, "batchId")?,
    };
    require_school(conn, &student.school_id)?;
    if let Some(class_id) = &student.class_id {
        require_row(conn, "SELECT 1 FROM classes WHERE id = ?", class_id, "class")?;
    }
    let student_id = school::create_student(conn, &student)
        .map_err(|e| HandlerErr::store("db_insert_failed", e).with_details(json!({ "table": "students" })))?;
    Ok(json!({
        "studentId": student_id,
        "classId": student.class_id,
        "batchId": student.batch_id
    }))
}

fn enrollments_set_status(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let p = &req.params;
    let kind_raw = get_opt_str(p, "kind")?.unwrap_or_else(|| "class".to_string());
    let Some(kind) = EnrollmentKind::parse(&kind_raw) else {
        return Err(HandlerErr::bad_params("kind must be one of: class, batch"));
    };
    let group_key = match kind {
        EnrollmentKind::Class => "classId",
        EnrollmentKind::Batch => "batchId",
    };
    let group_id = get_required_str(p, group_key)?;
    let student_id = get_required_str(p, "studentId")?;
    let status = get_required_str(p, "status")?;
    require_row(conn, "SELECT 1 FROM students WHERE id = ?", &student_id, "student")?;
    if kind == EnrollmentKind::Class {
        require_row(conn, "SELECT 1 FROM classes WHERE id = ?", &group_id, "class")?;
    }
    school::set_enrollment_status(conn, kind, &group_id, &student_id, &status)
        .map_err(|e| HandlerErr::store("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "schools.create" => schools_create(state, req),
        "classes.create" => classes_create(state, req),
        "students.create" => students_create(state, req),
        "enrollments.setStatus" => enrollments_set_status(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
