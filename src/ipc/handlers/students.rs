use crate::calc::EnrollmentStatus;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_exists, db_conn, optional_str, parse_status, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    if course_exists(conn, &course_id)?.is_none() {
        return Err(HandlerErr::new("not_found", "course not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, student_no, status, sort_order,
                    final_theory, final_practical, final_grade, updated_at
             FROM students
             WHERE course_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&course_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "lastName": last,
                "firstName": first,
                "displayName": format!("{}, {}", last, first),
                "studentNo": r.get::<_, Option<String>>(3)?,
                "status": r.get::<_, String>(4)?,
                "sortOrder": r.get::<_, i64>(5)?,
                "finalTheory": r.get::<_, f64>(6)?,
                "finalPractical": r.get::<_, f64>(7)?,
                "finalGrade": r.get::<_, f64>(8)?,
                "updatedAt": r.get::<_, Option<String>>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let last_name = required_str(params, "lastName")?;
    let first_name = required_str(params, "firstName")?;
    let student_no = optional_str(params, "studentNo");
    let status = match params.get("status").filter(|v| !v.is_null()) {
        Some(v) => parse_status(v, "status")?,
        None => EnrollmentStatus::Enrolled,
    };

    if course_exists(conn, &course_id)?.is_none() {
        return Err(HandlerErr::new("not_found", "course not found"));
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    // The grade record starts empty: no grade_cells rows, zeroed finals.
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
           id, course_id, last_name, first_name, student_no, status, sort_order, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &course_id,
            &last_name,
            &first_name,
            student_no.as_deref(),
            status.as_str(),
            sort_order,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;

    Ok(json!({ "studentId": student_id, "sortOrder": sort_order }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "lastName" | "firstName" => {
                let s = v.as_str().map(str::trim).unwrap_or("");
                if s.is_empty() {
                    return Err(HandlerErr::bad_params(format!("{} must not be empty", k)));
                }
                sets.push(if k == "lastName" {
                    "last_name = ?"
                } else {
                    "first_name = ?"
                });
                values.push(rusqlite::types::Value::Text(s.to_string()));
            }
            "studentNo" => {
                sets.push("student_no = ?");
                values.push(match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                    Some(s) => rusqlite::types::Value::Text(s.to_string()),
                    None => rusqlite::types::Value::Null,
                });
            }
            // Manual status edits are how students get cancelled or withdrawn.
            "status" => {
                let status = parse_status(v, "status")?;
                sets.push("status = ?");
                values.push(rusqlite::types::Value::Text(status.as_str().to_string()));
            }
            other => {
                return Err(HandlerErr::bad_params(format!("unknown student field: {}", other)))
            }
        }
    }
    if sets.is_empty() {
        return Ok(json!({ "ok": true }));
    }

    sets.push("updated_at = ?");
    values.push(rusqlite::types::Value::Text(chrono::Utc::now().to_rfc3339()));
    values.push(rusqlite::types::Value::Text(student_id));
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    conn.execute(&sql, rusqlite::params_from_iter(values))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (table, sql) in [
        ("grade_cells", "DELETE FROM grade_cells WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        tx.execute(sql, [&student_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "students.list" => students_list,
            "students.create" => students_create,
            "students.update" => students_update,
            "students.delete" => students_delete,
            _ => return None,
        };
    let result = db_conn(state).and_then(|conn| op(conn, &req.params));
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
