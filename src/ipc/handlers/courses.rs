use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_exists, course_type_by_code, db_conn, optional_str, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schema::{self, EvaluationSchema};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_count(conn: &Connection, course_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM students WHERE course_id = ?",
        [course_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::query)
}

fn parse_starts_on(params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = optional_str(params, "startsOn") else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map(|d| Some(d.format("%Y-%m-%d").to_string()))
        .map_err(|_| {
            HandlerErr::bad_params("startsOn must be YYYY-MM-DD")
                .with_details(json!({ "startsOn": raw }))
        })
}

fn course_types_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut all = schema::builtin_course_types();
    all.extend(db::list_custom_course_types(conn).map_err(HandlerErr::query)?);
    Ok(json!({ "courseTypes": all }))
}

fn course_types_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = required_str(params, "code")?;
    let name = required_str(params, "name")?;
    let Some(raw_schema) = params.get("schema") else {
        return Err(HandlerErr::bad_params("missing schema"));
    };
    let schema: EvaluationSchema = serde_json::from_value(raw_schema.clone())
        .map_err(|e| HandlerErr::bad_params(format!("schema: {}", e)))?;
    let ct = schema::custom_course_type(&code, &name, schema)?;

    // The field layout is fixed once students exist; names may still change.
    let existing = db::list_custom_course_types(conn)
        .map_err(HandlerErr::query)?
        .into_iter()
        .find(|c| c.code == ct.code);
    if existing.is_some_and(|c| c.schema != ct.schema) {
        let enrolled: i64 = conn
            .query_row(
                "SELECT COUNT(*)
                 FROM students s
                 JOIN courses c ON c.id = s.course_id
                 WHERE c.course_type = ?",
                [&ct.code],
                |r| r.get(0),
            )
            .map_err(HandlerErr::query)?;
        if enrolled > 0 {
            return Err(HandlerErr::new(
                "in_use",
                "course type schema cannot change while students are enrolled",
            )
            .with_details(json!({ "studentCount": enrolled })));
        }
    }

    db::upsert_custom_course_type(conn, &ct).map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "course_types" }))
    })?;
    Ok(json!({ "courseType": ct }))
}

fn course_types_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = required_str(params, "code")?.to_ascii_lowercase();
    if schema::is_builtin_code(&code) {
        return Err(HandlerErr::bad_params("built-in course types cannot be deleted"));
    }
    let in_use: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM courses WHERE course_type = ?",
            [&code],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    if in_use > 0 {
        return Err(HandlerErr::new("in_use", "course type is used by courses")
            .with_details(json!({ "courseCount": in_use })));
    }
    let removed = conn
        .execute("DELETE FROM course_types WHERE code = ?", [&code])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if removed == 0 {
        return Err(HandlerErr::new("not_found", "course type not found"));
    }
    Ok(json!({ "ok": true }))
}

fn courses_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.course_type,
               c.starts_on,
               c.location,
               (SELECT COUNT(*) FROM students s WHERE s.course_id = c.id) AS student_count
             FROM courses c
             ORDER BY c.starts_on, c.name",
        )
        .map_err(HandlerErr::query)?;
    let courses = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "courseType": r.get::<_, String>(2)?,
                "startsOn": r.get::<_, Option<String>>(3)?,
                "location": r.get::<_, Option<String>>(4)?,
                "studentCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "courses": courses }))
}

fn courses_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let course_type = required_str(params, "courseType")?.to_ascii_lowercase();
    course_type_by_code(conn, &course_type)?;
    let starts_on = parse_starts_on(params)?;
    let location = optional_str(params, "location");

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, name, course_type, starts_on, location) VALUES(?, ?, ?, ?, ?)",
        (
            &course_id,
            &name,
            &course_type,
            starts_on.as_deref(),
            location.as_deref(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "courses" }))
    })?;
    Ok(json!({ "courseId": course_id, "name": name, "courseType": course_type }))
}

fn courses_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let Some(patch) = params.get("patch").filter(|p| p.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    if course_exists(conn, &course_id)?.is_none() {
        return Err(HandlerErr::new("not_found", "course not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let update_failed = |e: rusqlite::Error| HandlerErr::new("db_update_failed", e.to_string());

    if patch.get("name").is_some() {
        let name = required_str(patch, "name")?;
        tx.execute("UPDATE courses SET name = ? WHERE id = ?", (&name, &course_id))
            .map_err(update_failed)?;
    }
    if patch.get("startsOn").is_some() {
        let starts_on = parse_starts_on(patch)?;
        tx.execute(
            "UPDATE courses SET starts_on = ? WHERE id = ?",
            (starts_on.as_deref(), &course_id),
        )
        .map_err(update_failed)?;
    }
    if patch.get("location").is_some() {
        let location = optional_str(patch, "location");
        tx.execute(
            "UPDATE courses SET location = ? WHERE id = ?",
            (location.as_deref(), &course_id),
        )
        .map_err(update_failed)?;
    }
    if patch.get("courseType").is_some() {
        let course_type = required_str(patch, "courseType")?.to_ascii_lowercase();
        course_type_by_code(conn, &course_type)?;
        // Grade cells are keyed by the course type's fields.
        if student_count(conn, &course_id)? > 0 {
            return Err(HandlerErr::new(
                "in_use",
                "course type cannot change while students are enrolled",
            ));
        }
        tx.execute(
            "UPDATE courses SET course_type = ? WHERE id = ?",
            (&course_type, &course_id),
        )
        .map_err(update_failed)?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn courses_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let force = params
        .get("force")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "course not found"));
    }
    let students = student_count(conn, &course_id)?;
    if students > 0 && !force {
        return Err(HandlerErr::new("in_use", "course still has students")
            .with_details(json!({ "studentCount": students })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Explicit dependency order (no ON DELETE CASCADE).
    for (table, sql) in [
        (
            "grade_cells",
            "DELETE FROM grade_cells
             WHERE student_id IN (SELECT id FROM students WHERE course_id = ?)",
        ),
        ("students", "DELETE FROM students WHERE course_id = ?"),
        ("courses", "DELETE FROM courses WHERE id = ?"),
    ] {
        tx.execute(sql, [&course_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tracing::info!("course {} deleted ({} students)", course_id, students);
    Ok(json!({ "ok": true, "studentsDeleted": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "courseTypes.list" => course_types_list,
            "courseTypes.upsert" => course_types_upsert,
            "courseTypes.delete" => course_types_delete,
            "courses.list" => courses_list,
            "courses.create" => courses_create,
            "courses.update" => courses_update,
            "courses.delete" => courses_delete,
            _ => return None,
        };
    let result = db_conn(state).and_then(|conn| op(conn, &req.params));
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
