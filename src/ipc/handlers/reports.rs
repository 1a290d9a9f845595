use crate::calc::{self, EnrollmentStatus, Finals};
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::handlers::setup::{load_grading_policy, load_report_settings, ReportSettings};
use crate::ipc::helpers::{course_type_by_code, db_conn, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::schema::CourseType;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

struct ResultRow {
    student_id: String,
    display_name: String,
    student_no: Option<String>,
    status: EnrollmentStatus,
    grades: calc::GradeRecord,
    finals: Finals,
}

struct CourseResults {
    course_id: String,
    course_name: String,
    starts_on: Option<String>,
    course_type: CourseType,
    rows: Vec<ResultRow>,
}

fn load_course_results(
    conn: &Connection,
    course_id: &str,
    settings: &ReportSettings,
) -> Result<CourseResults, HandlerErr> {
    let course = conn
        .query_row(
            "SELECT name, course_type, starts_on FROM courses WHERE id = ?",
            [course_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((course_name, code, starts_on)) = course else {
        return Err(HandlerErr::new("not_found", "course not found"));
    };
    let course_type = course_type_by_code(conn, &code)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, student_no, status
             FROM students
             WHERE course_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut rows = Vec::with_capacity(students.len());
    for (student_id, last, first, student_no, status) in students {
        let status = EnrollmentStatus::parse(&status).unwrap_or(EnrollmentStatus::Enrolled);
        if !settings.include_withdrawn && status.is_locked() {
            continue;
        }
        let grades = db::load_grade_record(conn, &student_id).map_err(HandlerErr::query)?;
        let finals = calc::compute_finals(&course_type, &grades);
        rows.push(ResultRow {
            student_id,
            display_name: format!("{}, {}", last, first),
            student_no,
            status,
            grades,
            finals,
        });
    }

    Ok(CourseResults {
        course_id: course_id.to_string(),
        course_name,
        starts_on,
        course_type,
        rows,
    })
}

fn render_csv(results: &CourseResults, decimal_places: usize) -> String {
    let fields = results.course_type.schema.all_fields();
    let mut header: Vec<String> = vec![
        "student_no".into(),
        "student_name".into(),
        "status".into(),
    ];
    header.extend(fields.iter().map(|f| csv_quote(f)));
    header.extend(["final_theory", "final_practical", "final_grade"].map(String::from));

    let mut out = header.join(",");
    out.push('\n');
    for row in &results.rows {
        let mut cells: Vec<String> = vec![
            csv_quote(row.student_no.as_deref().unwrap_or("")),
            csv_quote(&row.display_name),
            row.status.as_str().to_string(),
        ];
        cells.extend(
            fields
                .iter()
                .map(|f| csv_quote(row.grades.get(f).unwrap_or(""))),
        );
        for x in [
            row.finals.final_theory,
            row.finals.final_practical,
            row.finals.final_grade,
        ] {
            cells.push(calc::format_decimal(x, decimal_places));
        }
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn course_results_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let settings = load_report_settings(conn).map_err(HandlerErr::query)?;
    let policy = load_grading_policy(conn).map_err(HandlerErr::query)?;
    let results = load_course_results(conn, &course_id, &settings)?;

    let rows: Vec<serde_json::Value> = results
        .rows
        .iter()
        .map(|row| {
            json!({
                "studentId": row.student_id,
                "displayName": row.display_name,
                "studentNo": row.student_no,
                "status": row.status,
                "grades": row.grades,
                "finalTheory": row.finals.final_theory,
                "finalPractical": row.finals.final_practical,
                "finalGrade": row.finals.final_grade,
                "atOrAbovePassMark": row.finals.final_grade >= policy.pass_mark,
            })
        })
        .collect();

    Ok(json!({
        "course": {
            "id": results.course_id,
            "name": results.course_name,
            "startsOn": results.starts_on,
            "courseType": results.course_type.code,
        },
        "columns": results.course_type.schema.all_fields(),
        "passMark": policy.pass_mark,
        "decimalPlaces": settings.decimal_places,
        "generatedAt": chrono::Utc::now().to_rfc3339(),
        "rows": rows,
    }))
}

fn course_results_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let settings = load_report_settings(conn).map_err(HandlerErr::query)?;
    let results = load_course_results(conn, &course_id, &settings)?;
    let csv = render_csv(&results, settings.decimal_places);
    tracing::debug!(
        "course results csv for {}: {} rows",
        course_id,
        results.rows.len()
    );
    Ok(json!({ "csv": csv, "rowsExported": results.rows.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let op: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr> =
        match req.method.as_str() {
            "reports.courseResultsModel" => course_results_model,
            "reports.courseResultsCsv" => course_results_csv,
            _ => return None,
        };
    let result = db_conn(state).and_then(|conn| op(conn, &req.params));
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::GradeRecord;
    use crate::schema::builtin_course_type;

    #[test]
    fn csv_quote_escapes_separators_and_quotes() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("Doe, Jane"), "\"Doe, Jane\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn csv_has_schema_columns_and_fixed_decimals() {
        let course_type = builtin_course_type("arff_refresher").expect("arff_refresher");
        let mut grades = GradeRecord::new();
        grades.set("exam", "8");
        let finals = calc::compute_finals(&course_type, &grades);
        let results = CourseResults {
            course_id: "c1".into(),
            course_name: "Refresher".into(),
            starts_on: None,
            rows: vec![ResultRow {
                student_id: "s1".into(),
                display_name: "Doe, Jane".into(),
                student_no: Some("17".into()),
                status: EnrollmentStatus::Pending,
                grades,
                finals,
            }],
            course_type,
        };

        let csv = render_csv(&results, 1);
        let mut lines = csv.lines();
        let header = lines.next().expect("header");
        assert!(header.starts_with("student_no,student_name,status,exam,recovery,"));
        assert!(header.ends_with(",final_theory,final_practical,final_grade"));
        let row = lines.next().expect("row");
        assert!(row.starts_with("17,\"Doe, Jane\",pending,8,,"));
        assert!(row.ends_with(",8.0,0.0,4.0"));
        assert!(lines.next().is_none());
    }
}
