use crate::schema::{
    self, CourseCategory, CourseType, EvaluationSchema, ATTEMPT_TIME_1, ATTEMPT_TIME_2,
    ERROR_COUNT, PRACTICAL_TEST_SCORE,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

/// Fields whose edits trigger a recomputation of the practical test score.
const DERIVED_SCORE_INPUTS: [&str; 3] = [ATTEMPT_TIME_1, ATTEMPT_TIME_2, ERROR_COUNT];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradeError {
    #[error("{field}: '{value}' is not a number")]
    InvalidInput { field: String, value: String },

    #[error("field '{field}' is not part of course type '{course_type}'")]
    UnknownField { field: String, course_type: String },

    #[error("unknown course type: {0}")]
    UnknownCourseType(String),

    #[error("invalid course type schema: {0}")]
    InvalidSchema(String),
}

impl GradeError {
    /// Stable wire code for IPC error responses.
    pub fn code(&self) -> &'static str {
        match self {
            GradeError::InvalidInput { .. } => "invalid_input",
            GradeError::UnknownField { .. } => "unknown_field",
            GradeError::UnknownCourseType(_) => "not_found",
            GradeError::InvalidSchema(_) => "bad_params",
        }
    }
}

/// A grade cell as typed input: blank, a number, or text that is not a number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Empty,
    Numeric(f64),
    Invalid,
}

impl FieldValue {
    pub fn parse(raw: &str) -> Self {
        let t = raw.trim();
        if t.is_empty() {
            return FieldValue::Empty;
        }
        match t.parse::<f64>() {
            Ok(v) if v.is_finite() => FieldValue::Numeric(v),
            _ => FieldValue::Invalid,
        }
    }

    /// Arithmetic view: blanks and invalid text count as 0.
    pub fn as_number(self) -> f64 {
        match self {
            FieldValue::Numeric(v) => v,
            FieldValue::Empty | FieldValue::Invalid => 0.0,
        }
    }

    pub fn is_entered(self) -> bool {
        !matches!(self, FieldValue::Empty)
    }
}

/// Raw grade cells of one student keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GradeRecord(BTreeMap<String, String>);

impl GradeRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn value(&self, field: &str) -> FieldValue {
        self.get(field).map(FieldValue::parse).unwrap_or(FieldValue::Empty)
    }

    pub fn number(&self, field: &str) -> f64 {
        self.value(field).as_number()
    }

    /// Blank values remove the cell.
    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        let value = value.into();
        if value.trim().is_empty() {
            self.0.remove(field);
        } else {
            self.0.insert(field.to_string(), value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when any field of `schema` holds something other than blank
    /// or zero. Cells outside the schema are ignored.
    pub fn has_any_grade(&self, schema: &EvaluationSchema) -> bool {
        schema
            .all_fields()
            .into_iter()
            .any(|field| match self.value(field) {
                FieldValue::Empty => false,
                FieldValue::Numeric(v) => v != 0.0,
                FieldValue::Invalid => true,
            })
    }

    /// Accepts the loose JSON shapes the front end sends: strings, numbers
    /// and nulls (ignored).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, GradeError> {
        let mut out = GradeRecord::new();
        let Some(obj) = value.as_object() else {
            return Err(GradeError::InvalidInput {
                field: "grades".to_string(),
                value: value.to_string(),
            });
        };
        for (k, v) in obj {
            match v {
                serde_json::Value::Null => {}
                serde_json::Value::String(s) => out.set(k, s.clone()),
                serde_json::Value::Number(n) => out.set(k, n.to_string()),
                other => {
                    return Err(GradeError::InvalidInput {
                        field: k.clone(),
                        value: other.to_string(),
                    })
                }
            }
        }
        Ok(out)
    }
}

impl FromIterator<(String, String)> for GradeRecord {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut out = GradeRecord::new();
        for (k, v) in iter {
            out.set(&k, v);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Enrolled,
    Pending,
    Approved,
    Failed,
    Cancelled,
    Withdrawn,
}

impl EnrollmentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enrolled" => Some(Self::Enrolled),
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "withdrawn" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enrolled => "enrolled",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Withdrawn => "withdrawn",
        }
    }

    /// Statuses that grade entry never overwrites.
    pub fn is_locked(self) -> bool {
        matches!(self, Self::Cancelled | Self::Withdrawn)
    }
}

/// Thresholds and penalties applied by the engine. Stored per workspace
/// under `setup.grading`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GradingPolicy {
    pub pass_mark: f64,
    pub exam_floor: f64,
    pub practical_base_score: f64,
    pub time_threshold_seconds: f64,
    pub time_penalty_step_seconds: f64,
    pub time_penalty_per_step: f64,
    pub error_penalty: f64,
    pub strict_input: bool,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self {
            pass_mark: 7.0,
            exam_floor: 5.0,
            practical_base_score: 10.0,
            time_threshold_seconds: 90.0,
            time_penalty_step_seconds: 10.0,
            time_penalty_per_step: 1.0,
            error_penalty: 0.5,
            strict_input: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finals {
    pub final_theory: f64,
    pub final_practical: f64,
    pub final_grade: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentEvaluation {
    pub final_theory: f64,
    pub final_practical: f64,
    pub final_grade: f64,
    pub enrollment_status: EnrollmentStatus,
}

impl StudentEvaluation {
    fn new(finals: Finals, status: EnrollmentStatus) -> Self {
        Self {
            final_theory: finals.final_theory,
            final_practical: finals.final_practical,
            final_grade: finals.final_grade,
            enrollment_status: status,
        }
    }
}

/// Per-category strategy: how theory is averaged and how a status is decided.
pub struct CourseRules {
    pub theory: fn(&EvaluationSchema, &GradeRecord) -> f64,
    pub status: fn(&EvaluationSchema, &GradeRecord, &Finals, &GradingPolicy) -> EnrollmentStatus,
}

static THREE_EXAM_RULES: CourseRules = CourseRules {
    theory: three_exam_theory,
    status: three_exam_status,
};

static SINGLE_EXAM_RULES: CourseRules = CourseRules {
    theory: single_exam_theory,
    status: single_exam_status,
};

static CUSTOM_RULES: CourseRules = CourseRules {
    theory: custom_theory,
    status: custom_status,
};

pub fn rules_for(category: CourseCategory) -> &'static CourseRules {
    match category {
        CourseCategory::ThreeExam => &THREE_EXAM_RULES,
        CourseCategory::SingleExam => &SINGLE_EXAM_RULES,
        CourseCategory::Custom => &CUSTOM_RULES,
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0_f64;
    let mut n = 0_usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n > 0 {
        sum / (n as f64)
    } else {
        0.0
    }
}

// Mains plus recovery, best N kept where N is the number of mains. A
// recovery score only displaces the weakest main when it is higher.
fn three_exam_theory(schema: &EvaluationSchema, grades: &GradeRecord) -> f64 {
    let mains = schema.theory_fields.len();
    if mains == 0 {
        return 0.0;
    }
    let mut scores: Vec<f64> = schema
        .theory_fields
        .iter()
        .map(|f| grades.number(f))
        .collect();
    if let Some(r) = schema.recovery_field.as_deref() {
        scores.push(grades.number(r));
    }
    scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    mean(scores.into_iter().take(mains))
}

fn single_exam_theory(schema: &EvaluationSchema, grades: &GradeRecord) -> f64 {
    let main = schema
        .theory_fields
        .first()
        .map(|f| grades.number(f))
        .unwrap_or(0.0);
    let recovery = schema
        .recovery_field
        .as_deref()
        .map(|f| grades.number(f))
        .unwrap_or(0.0);
    main.max(recovery)
}

fn custom_theory(schema: &EvaluationSchema, grades: &GradeRecord) -> f64 {
    mean(schema.theory_fields.iter().map(|f| grades.number(f)))
}

fn practical_average(schema: &EvaluationSchema, grades: &GradeRecord) -> f64 {
    mean(
        schema
            .averaged_practice_fields
            .iter()
            .map(|f| grades.number(f)),
    )
}

fn entered_below(grades: &GradeRecord, field: &str, floor: f64) -> bool {
    let v = grades.value(field);
    v.is_entered() && v.as_number() < floor
}

fn pass_or_fail(passed: bool) -> EnrollmentStatus {
    if passed {
        EnrollmentStatus::Approved
    } else {
        EnrollmentStatus::Failed
    }
}

fn three_exam_status(
    schema: &EvaluationSchema,
    grades: &GradeRecord,
    finals: &Finals,
    policy: &GradingPolicy,
) -> EnrollmentStatus {
    if schema
        .theory_fields
        .iter()
        .any(|f| entered_below(grades, f, policy.exam_floor))
    {
        return EnrollmentStatus::Failed;
    }
    pass_or_fail(finals.final_grade >= policy.pass_mark)
}

fn single_exam_status(
    schema: &EvaluationSchema,
    grades: &GradeRecord,
    finals: &Finals,
    policy: &GradingPolicy,
) -> EnrollmentStatus {
    let main_failed = schema
        .theory_fields
        .first()
        .map(|f| entered_below(grades, f, policy.exam_floor))
        .unwrap_or(false);
    if main_failed {
        return EnrollmentStatus::Failed;
    }
    pass_or_fail(finals.final_grade >= policy.pass_mark && finals.final_theory >= policy.pass_mark)
}

fn custom_status(
    _schema: &EvaluationSchema,
    _grades: &GradeRecord,
    finals: &Finals,
    policy: &GradingPolicy,
) -> EnrollmentStatus {
    pass_or_fail(
        finals.final_theory >= policy.pass_mark
            && finals.final_practical >= policy.pass_mark
            && finals.final_grade >= policy.pass_mark,
    )
}

pub fn compute_finals(course: &CourseType, grades: &GradeRecord) -> Finals {
    let rules = rules_for(course.category);
    let final_theory = (rules.theory)(&course.schema, grades);
    let final_practical = practical_average(&course.schema, grades);
    Finals {
        final_theory,
        final_practical,
        final_grade: (final_theory + final_practical) / 2.0,
    }
}

/// Approved/Failed per the course rules, except that locked statuses and
/// untouched records keep `current`.
pub fn derive_status(
    course: &CourseType,
    grades: &GradeRecord,
    finals: &Finals,
    current: EnrollmentStatus,
    policy: &GradingPolicy,
) -> EnrollmentStatus {
    if current.is_locked() || !grades.has_any_grade(&course.schema) {
        return current;
    }
    (rules_for(course.category).status)(&course.schema, grades, finals, policy)
}

/// `mm:ss` to seconds. Anything else is infinitely slow.
pub fn parse_time_seconds(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return f64::INFINITY;
    };
    let Some((m, s)) = raw.trim().split_once(':') else {
        return f64::INFINITY;
    };
    let (m, s) = (m.trim(), s.trim());
    if m.is_empty() || s.is_empty() {
        return f64::INFINITY;
    }
    match (m.parse::<u32>(), s.parse::<u32>()) {
        (Ok(m), Ok(s)) => f64::from(m) * 60.0 + f64::from(s),
        _ => f64::INFINITY,
    }
}

pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

// Digits only; anything else counts as no errors. Counts too large for
// an integer type still clamp the score to 0.
fn parse_error_count(raw: Option<&str>) -> f64 {
    let Some(s) = raw.map(str::trim) else {
        return 0.0;
    };
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return 0.0;
    }
    s.parse::<f64>().unwrap_or(0.0)
}

/// Practical test score from two attempt times and an error count.
/// `None` when neither attempt time is usable.
pub fn practical_test_score(
    time1: Option<&str>,
    time2: Option<&str>,
    errors: Option<&str>,
    policy: &GradingPolicy,
) -> Option<f64> {
    let best = parse_time_seconds(time1).min(parse_time_seconds(time2));
    if !best.is_finite() {
        return None;
    }
    let mut score = policy.practical_base_score;
    if best > policy.time_threshold_seconds && policy.time_penalty_step_seconds > 0.0 {
        let steps = ((best - policy.time_threshold_seconds) / policy.time_penalty_step_seconds)
            .floor();
        score -= steps * policy.time_penalty_per_step;
    }
    score -= policy.error_penalty * parse_error_count(errors);
    Some(score.max(0.0))
}

/// Declared numeric fields whose text is not a number.
pub fn invalid_fields(schema: &EvaluationSchema, grades: &GradeRecord) -> Vec<String> {
    schema
        .all_fields()
        .into_iter()
        .filter(|f| !schema.is_time_field(f))
        .filter(|f| grades.value(f) == FieldValue::Invalid)
        .map(str::to_string)
        .collect()
}

/// Rejects records a strict policy would not coerce. A no-op otherwise.
pub fn validate_record(
    course: &CourseType,
    grades: &GradeRecord,
    policy: &GradingPolicy,
) -> Result<(), GradeError> {
    if !policy.strict_input {
        return Ok(());
    }
    for (field, raw) in grades.iter() {
        if !course.schema.contains(field) {
            return Err(GradeError::UnknownField {
                field: field.to_string(),
                course_type: course.code.clone(),
            });
        }
        if !course.schema.is_time_field(field) && FieldValue::parse(raw) == FieldValue::Invalid {
            return Err(GradeError::InvalidInput {
                field: field.to_string(),
                value: raw.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    #[serde(flatten)]
    pub evaluation: StudentEvaluation,
    pub invalid_fields: Vec<String>,
}

pub fn evaluate(
    course: &CourseType,
    grades: &GradeRecord,
    current: EnrollmentStatus,
    policy: &GradingPolicy,
) -> Result<Evaluation, GradeError> {
    validate_record(course, grades, policy)?;
    let finals = compute_finals(course, grades);
    let status = derive_status(course, grades, &finals, current, policy);
    Ok(Evaluation {
        evaluation: StudentEvaluation::new(finals, status),
        invalid_fields: invalid_fields(&course.schema, grades),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub grades: GradeRecord,
    #[serde(flatten)]
    pub evaluation: StudentEvaluation,
    pub derived_field: Option<String>,
    pub invalid_fields: Vec<String>,
}

/// One keystroke of grade entry: writes `raw` into `field`, refreshes the
/// derived practical test score when one of its inputs changed, and
/// recomputes averages and status. Nothing is persisted.
pub fn apply_field_change(
    course: &CourseType,
    current: &GradeRecord,
    field: &str,
    raw: &str,
    status: EnrollmentStatus,
    policy: &GradingPolicy,
) -> Result<FieldChange, GradeError> {
    let schema = &course.schema;
    if policy.strict_input && !schema.contains(field) {
        return Err(GradeError::UnknownField {
            field: field.to_string(),
            course_type: course.code.clone(),
        });
    }

    let value = if schema.is_integer_field(field) {
        digits_only(raw)
    } else {
        raw.to_string()
    };
    if policy.strict_input
        && !schema.is_time_field(field)
        && FieldValue::parse(&value) == FieldValue::Invalid
    {
        return Err(GradeError::InvalidInput {
            field: field.to_string(),
            value,
        });
    }

    let mut grades = current.clone();
    grades.set(field, value);

    let mut derived_field = None;
    if schema.derives_practical_score() && DERIVED_SCORE_INPUTS.contains(&field) {
        if let Some(score) = practical_test_score(
            grades.get(ATTEMPT_TIME_1),
            grades.get(ATTEMPT_TIME_2),
            grades.get(ERROR_COUNT),
            policy,
        ) {
            grades.set(PRACTICAL_TEST_SCORE, format!("{:.2}", score));
            derived_field = Some(PRACTICAL_TEST_SCORE.to_string());
        }
    }

    let finals = compute_finals(course, &grades);
    let status = derive_status(course, &grades, &finals, status, policy);
    let invalid_fields = invalid_fields(schema, &grades);
    Ok(FieldChange {
        grades,
        evaluation: StudentEvaluation::new(finals, status),
        derived_field,
        invalid_fields,
    })
}

/// Resolves a course type code against the built-ins and any workspace
/// types passed in.
pub fn resolve_course_type(
    code: &str,
    custom: impl IntoIterator<Item = CourseType>,
) -> Result<CourseType, GradeError> {
    if let Some(ct) = schema::builtin_course_type(code) {
        return Ok(ct);
    }
    custom
        .into_iter()
        .find(|c| c.code == code)
        .ok_or_else(|| GradeError::UnknownCourseType(code.to_string()))
}

/// Fixed-decimal rendering used by reports and previews.
pub fn format_decimal(x: f64, places: usize) -> String {
    format!("{:.*}", places, x)
}
