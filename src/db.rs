use crate::calc::{EnrollmentStatus, GradeRecord, StudentEvaluation};
use crate::schema::{self, CourseCategory, CourseType, EvaluationSchema};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "academy.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_types(
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            schema_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            course_type TEXT NOT NULL,
            starts_on TEXT,
            location TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            status TEXT NOT NULL DEFAULT 'enrolled',
            sort_order INTEGER NOT NULL,
            final_theory REAL NOT NULL DEFAULT 0,
            final_practical REAL NOT NULL DEFAULT 0,
            final_grade REAL NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_course_sort ON students(course_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_cells(
            student_id TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY(student_id, field),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some(text) => Ok(Some(
            serde_json::from_str(&text)
                .with_context(|| format!("settings value for {} is not JSON", key))?,
        )),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Workspace-defined course types. Rows that no longer validate are skipped.
pub fn list_custom_course_types(conn: &Connection) -> anyhow::Result<Vec<CourseType>> {
    let mut stmt =
        conn.prepare("SELECT code, name, category, schema_json FROM course_types ORDER BY code")?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (code, name, category, schema_json) in rows {
        if CourseCategory::parse(&category) != Some(CourseCategory::Custom) {
            tracing::warn!("course type {} has unsupported category {}", code, category);
            continue;
        }
        let parsed = serde_json::from_str::<EvaluationSchema>(&schema_json)
            .map_err(|e| e.to_string())
            .and_then(|s| {
                schema::custom_course_type(&code, &name, s).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(ct) => out.push(ct),
            Err(e) => tracing::warn!("skipping course type {}: {}", code, e),
        }
    }
    Ok(out)
}

pub fn upsert_custom_course_type(conn: &Connection, ct: &CourseType) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO course_types(code, name, category, schema_json) VALUES(?, ?, ?, ?)
         ON CONFLICT(code) DO UPDATE SET
           name = excluded.name,
           category = excluded.category,
           schema_json = excluded.schema_json",
        (
            &ct.code,
            &ct.name,
            ct.category.as_str(),
            serde_json::to_string(&ct.schema)?,
        ),
    )?;
    Ok(())
}

pub fn load_grade_record(conn: &Connection, student_id: &str) -> anyhow::Result<GradeRecord> {
    let mut stmt =
        conn.prepare("SELECT field, value FROM grade_cells WHERE student_id = ? ORDER BY field")?;
    let cells = stmt
        .query_map([student_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cells.into_iter().collect())
}

/// Replaces every cell of the student's record. Callers own the transaction.
pub fn replace_grade_record(
    conn: &Connection,
    student_id: &str,
    grades: &GradeRecord,
) -> anyhow::Result<()> {
    conn.execute("DELETE FROM grade_cells WHERE student_id = ?", [student_id])?;
    let mut stmt =
        conn.prepare("INSERT INTO grade_cells(student_id, field, value) VALUES(?, ?, ?)")?;
    for (field, value) in grades.iter() {
        stmt.execute((student_id, field, value))?;
    }
    Ok(())
}

pub fn store_evaluation(
    conn: &Connection,
    student_id: &str,
    evaluation: &StudentEvaluation,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE students SET
           final_theory = ?,
           final_practical = ?,
           final_grade = ?,
           status = ?,
           updated_at = ?
         WHERE id = ?",
        (
            evaluation.final_theory,
            evaluation.final_practical,
            evaluation.final_grade,
            evaluation.enrollment_status.as_str(),
            chrono::Utc::now().to_rfc3339(),
            student_id,
        ),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StudentGradeContext {
    pub course_id: String,
    pub course_type: String,
    pub status: EnrollmentStatus,
}

/// Course type and current status of a student, or `None` if unknown.
pub fn student_grade_context(
    conn: &Connection,
    student_id: &str,
) -> anyhow::Result<Option<StudentGradeContext>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT s.course_id, c.course_type, s.status
             FROM students s
             JOIN courses c ON c.id = s.course_id
             WHERE s.id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    Ok(row.map(|(course_id, course_type, status)| StudentGradeContext {
        course_id,
        course_type,
        // Unknown stored statuses are treated as a fresh enrollment.
        status: EnrollmentStatus::parse(&status).unwrap_or(EnrollmentStatus::Enrolled),
    }))
}
