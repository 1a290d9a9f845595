use crate::calc::{self, EnrollmentStatus, GradeError};
use crate::db;
use crate::ipc::error::err;
use crate::ipc::types::AppState;
use crate::schema::CourseType;
use rusqlite::Connection;
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

impl From<GradeError> for HandlerErr {
    fn from(e: GradeError) -> Self {
        let details = match &e {
            GradeError::InvalidInput { field, value } => {
                Some(json!({ "field": field, "value": value }))
            }
            GradeError::UnknownField { field, course_type } => {
                Some(json!({ "field": field, "courseType": course_type }))
            }
            GradeError::UnknownCourseType(code) => Some(json!({ "courseType": code })),
            GradeError::InvalidSchema(_) => None,
        };
        HandlerErr {
            code: e.code(),
            message: e.to_string(),
            details,
        }
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string or `None` when absent, null or blank.
pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn parse_status(raw: &serde_json::Value, key: &str) -> Result<EnrollmentStatus, HandlerErr> {
    raw.as_str()
        .and_then(EnrollmentStatus::parse)
        .ok_or_else(|| {
            HandlerErr::bad_params(format!(
                "{} must be one of: enrolled, pending, approved, failed, cancelled, withdrawn",
                key
            ))
        })
}

pub fn course_type_by_code(conn: &Connection, code: &str) -> Result<CourseType, HandlerErr> {
    let custom = db::list_custom_course_types(conn).map_err(HandlerErr::query)?;
    Ok(calc::resolve_course_type(code, custom)?)
}

pub fn course_exists(conn: &Connection, course_id: &str) -> Result<Option<String>, HandlerErr> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT course_type FROM courses WHERE id = ?",
        [course_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(HandlerErr::query)
}
