use crate::calc::{self, EnrollmentStatus, GradeRecord};
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::handlers::setup::load_grading_policy;
use crate::ipc::helpers::{
    course_exists, course_type_by_code, db_conn, optional_str, parse_status, required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schema::CourseType;
use rusqlite::Connection;
use serde_json::json;

struct StudentSheet {
    course_id: String,
    course_type: CourseType,
    grades: GradeRecord,
    status: EnrollmentStatus,
}

fn load_student_sheet(conn: &Connection, student_id: &str) -> Result<StudentSheet, HandlerErr> {
    let ctx = db::student_grade_context(conn, student_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
    let course_type = course_type_by_code(conn, &ctx.course_type)?;
    let grades = db::load_grade_record(conn, student_id).map_err(HandlerErr::query)?;
    Ok(StudentSheet {
        course_id: ctx.course_id,
        course_type,
        grades,
        status: ctx.status,
    })
}

fn grades_param(params: &serde_json::Value) -> Result<Option<GradeRecord>, HandlerErr> {
    match params.get("grades") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => Ok(Some(GradeRecord::from_json(v)?)),
    }
}

fn status_param(params: &serde_json::Value) -> Result<Option<EnrollmentStatus>, HandlerErr> {
    match params.get("status") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => parse_status(v, "status").map(Some),
    }
}

fn policy(conn: &Connection) -> Result<calc::GradingPolicy, HandlerErr> {
    load_grading_policy(conn).map_err(HandlerErr::query)
}

fn grades_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let sheet = load_student_sheet(conn, &student_id)?;
    let finals = calc::compute_finals(&sheet.course_type, &sheet.grades);
    Ok(json!({
        "studentId": student_id,
        "courseId": sheet.course_id,
        "courseType": sheet.course_type.code,
        "fields": sheet.course_type.schema.all_fields(),
        "grades": sheet.grades,
        "finalTheory": finals.final_theory,
        "finalPractical": finals.final_practical,
        "finalGrade": finals.final_grade,
        "enrollmentStatus": sheet.status,
        "invalidFields": calc::invalid_fields(&sheet.course_type.schema, &sheet.grades),
    }))
}

fn grades_evaluate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = required_str(params, "courseType")?.to_ascii_lowercase();
    let course_type = course_type_by_code(conn, &code)?;
    let grades = grades_param(params)?.unwrap_or_default();
    let status = status_param(params)?.unwrap_or(EnrollmentStatus::Enrolled);
    let evaluation = calc::evaluate(&course_type, &grades, status, &policy(conn)?)?;
    Ok(json!(evaluation))
}

fn value_param(params: &serde_json::Value) -> Result<String, HandlerErr> {
    match params.get("value") {
        None | Some(serde_json::Value::Null) => Ok(String::new()),
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(HandlerErr::bad_params("value must be a string or number")),
    }
}

// Preview only: the front end calls this per keystroke and persists with
// grades.save.
fn grades_apply_field_change(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let field = required_str(params, "field")?;
    let value = value_param(params)?;

    let (course_type, grades, status) = match optional_str(params, "studentId") {
        Some(student_id) => {
            let sheet = load_student_sheet(conn, &student_id)?;
            (
                sheet.course_type,
                grades_param(params)?.unwrap_or(sheet.grades),
                status_param(params)?.unwrap_or(sheet.status),
            )
        }
        None => {
            let Some(code) = optional_str(params, "courseType") else {
                return Err(HandlerErr::bad_params("missing studentId or courseType"));
            };
            (
                course_type_by_code(conn, &code.to_ascii_lowercase())?,
                grades_param(params)?.unwrap_or_default(),
                status_param(params)?.unwrap_or(EnrollmentStatus::Enrolled),
            )
        }
    };

    let change = calc::apply_field_change(
        &course_type,
        &grades,
        &field,
        &value,
        status,
        &policy(conn)?,
    )?;
    Ok(json!(change))
}

fn grades_save(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let Some(grades) = grades_param(params)? else {
        return Err(HandlerErr::bad_params("missing grades"));
    };
    let sheet = load_student_sheet(conn, &student_id)?;
    let evaluation = calc::evaluate(&sheet.course_type, &grades, sheet.status, &policy(conn)?)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    db::replace_grade_record(&tx, &student_id, &grades).map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "grade_cells" }))
    })?;
    db::store_evaluation(&tx, &student_id, &evaluation.evaluation).map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::info!(
        "grades saved for {}: final {:.2} ({})",
        student_id,
        evaluation.evaluation.final_grade,
        evaluation.evaluation.enrollment_status.as_str()
    );
    Ok(json!(evaluation))
}

fn grades_recalculate_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let Some(code) = course_exists(conn, &course_id)? else {
        return Err(HandlerErr::new("not_found", "course not found"));
    };
    let course_type = course_type_by_code(conn, &code)?;
    let grading = policy(conn)?;

    let mut stmt = conn
        .prepare("SELECT id, status FROM students WHERE course_id = ? ORDER BY sort_order")
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&course_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut updated = 0_usize;
    let mut skipped: Vec<serde_json::Value> = Vec::new();
    for (student_id, status) in students {
        let status = EnrollmentStatus::parse(&status).unwrap_or(EnrollmentStatus::Enrolled);
        let grades = db::load_grade_record(&tx, &student_id).map_err(HandlerErr::query)?;
        match calc::evaluate(&course_type, &grades, status, &grading) {
            Ok(evaluation) => {
                db::store_evaluation(&tx, &student_id, &evaluation.evaluation).map_err(|e| {
                    HandlerErr::new("db_update_failed", e.to_string())
                        .with_details(json!({ "table": "students" }))
                })?;
                updated += 1;
            }
            Err(e) => skipped.push(json!({
                "studentId": student_id,
                "code": e.code(),
                "message": e.to_string(),
            })),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::info!(
        "recalculated course {}: {} updated, {} skipped",
        course_id,
        updated,
        skipped.len()
    );
    Ok(json!({ "updated": updated, "skipped": skipped }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "grades.get" => grades_get,
            "grades.evaluate" => grades_evaluate,
            "grades.applyFieldChange" => grades_apply_field_change,
            "grades.save" => grades_save,
            "grades.recalculateCourse" => grades_recalculate_course,
            _ => return None,
        };
    let result = db_conn(state).and_then(|conn| op(conn, &req.params));
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
