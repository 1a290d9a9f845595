use crate::calc::GradeError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// First timed attempt of the practical test (`mm:ss`).
pub const ATTEMPT_TIME_1: &str = "pt_time1";
/// Second timed attempt of the practical test (`mm:ss`).
pub const ATTEMPT_TIME_2: &str = "pt_time2";
/// Errors committed during the practical test (integer only).
pub const ERROR_COUNT: &str = "pt_errors";
/// Score derived from the best attempt time and the error count.
pub const PRACTICAL_TEST_SCORE: &str = "pt_score";

pub const CODE_MAX_LEN: usize = 32;
pub const NAME_MAX_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseCategory {
    ThreeExam,
    SingleExam,
    Custom,
}

impl CourseCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "three_exam" => Some(Self::ThreeExam),
            "single_exam" => Some(Self::SingleExam),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThreeExam => "three_exam",
            Self::SingleExam => "single_exam",
            Self::Custom => "custom",
        }
    }
}

/// Field layout of one course type's evaluation sheet.
///
/// `theory_fields` are the main exams. `recovery_field` is the makeup exam
/// consulted by the exam categories. Only `averaged_practice_fields` feed
/// the practical average; raw attempt times and error counts are inputs to
/// the derived practical test score instead.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluationSchema {
    pub theory_fields: Vec<String>,
    pub recovery_field: Option<String>,
    pub practice_fields: Vec<String>,
    pub time_fields: Vec<String>,
    pub integer_fields: Vec<String>,
    pub averaged_practice_fields: Vec<String>,
}

impl EvaluationSchema {
    pub fn contains(&self, field: &str) -> bool {
        self.theory_fields.iter().any(|f| f == field)
            || self.recovery_field.as_deref() == Some(field)
            || self.practice_fields.iter().any(|f| f == field)
    }

    pub fn is_time_field(&self, field: &str) -> bool {
        self.time_fields.iter().any(|f| f == field)
    }

    pub fn is_integer_field(&self, field: &str) -> bool {
        self.integer_fields.iter().any(|f| f == field)
    }

    /// Every declared field in sheet order: theory, recovery, practice.
    pub fn all_fields(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.theory_fields.iter().map(String::as_str).collect();
        if let Some(r) = self.recovery_field.as_deref() {
            out.push(r);
        }
        out.extend(self.practice_fields.iter().map(String::as_str));
        out
    }

    /// The practical test score is only derived when the sheet carries the
    /// score field together with both attempt times.
    pub fn derives_practical_score(&self) -> bool {
        self.practice_fields.iter().any(|f| f == PRACTICAL_TEST_SCORE)
            && self.is_time_field(ATTEMPT_TIME_1)
            && self.is_time_field(ATTEMPT_TIME_2)
    }

    pub fn validate(&self, category: CourseCategory) -> Result<(), GradeError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for f in self.all_fields() {
            if f.trim().is_empty() {
                return Err(GradeError::InvalidSchema(
                    "field names must not be empty".to_string(),
                ));
            }
            if !seen.insert(f) {
                return Err(GradeError::InvalidSchema(format!(
                    "field '{}' is declared more than once",
                    f
                )));
            }
        }
        if seen.is_empty() {
            return Err(GradeError::InvalidSchema(
                "schema must declare at least one field".to_string(),
            ));
        }
        for f in &self.averaged_practice_fields {
            if !self.practice_fields.contains(f) {
                return Err(GradeError::InvalidSchema(format!(
                    "averaged field '{}' is not a practice field",
                    f
                )));
            }
            if self.is_time_field(f) {
                return Err(GradeError::InvalidSchema(format!(
                    "time field '{}' cannot be averaged",
                    f
                )));
            }
        }
        for f in self.time_fields.iter().chain(self.integer_fields.iter()) {
            if !seen.contains(f.as_str()) {
                return Err(GradeError::InvalidSchema(format!(
                    "field '{}' is not declared on the sheet",
                    f
                )));
            }
        }
        match category {
            CourseCategory::Custom if self.recovery_field.is_some() => {
                Err(GradeError::InvalidSchema(
                    "recoveryField is only used by exam categories".to_string(),
                ))
            }
            CourseCategory::SingleExam if self.theory_fields.len() != 1 => {
                Err(GradeError::InvalidSchema(
                    "single_exam courses declare exactly one main exam".to_string(),
                ))
            }
            CourseCategory::ThreeExam if self.theory_fields.is_empty() => {
                Err(GradeError::InvalidSchema(
                    "three_exam courses declare their main exams".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseType {
    pub code: String,
    pub name: String,
    pub category: CourseCategory,
    pub schema: EvaluationSchema,
    pub builtin: bool,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn practical_block(theory: &[&str]) -> EvaluationSchema {
    EvaluationSchema {
        theory_fields: strings(theory),
        recovery_field: Some("recovery".to_string()),
        practice_fields: strings(&[
            ATTEMPT_TIME_1,
            ATTEMPT_TIME_2,
            ERROR_COUNT,
            PRACTICAL_TEST_SCORE,
            "equipment_check",
            "rescue_drill",
        ]),
        time_fields: strings(&[ATTEMPT_TIME_1, ATTEMPT_TIME_2]),
        integer_fields: strings(&[ERROR_COUNT]),
        averaged_practice_fields: strings(&[
            PRACTICAL_TEST_SCORE,
            "equipment_check",
            "rescue_drill",
        ]),
    }
}

pub fn builtin_course_types() -> Vec<CourseType> {
    vec![
        CourseType {
            code: "arff_initial".to_string(),
            name: "Aircraft rescue and firefighting - initial".to_string(),
            category: CourseCategory::ThreeExam,
            schema: practical_block(&["exam1", "exam2", "exam3"]),
            builtin: true,
        },
        CourseType {
            code: "arff_refresher".to_string(),
            name: "Aircraft rescue and firefighting - refresher".to_string(),
            category: CourseCategory::SingleExam,
            schema: practical_block(&["exam"]),
            builtin: true,
        },
    ]
}

pub fn builtin_course_type(code: &str) -> Option<CourseType> {
    builtin_course_types().into_iter().find(|c| c.code == code)
}

pub fn is_builtin_code(code: &str) -> bool {
    builtin_course_types().iter().any(|c| c.code == code)
}

pub fn normalize_code(raw: &str) -> Result<String, GradeError> {
    let code = raw.trim().to_ascii_lowercase();
    if code.is_empty() || code.len() > CODE_MAX_LEN {
        return Err(GradeError::InvalidSchema(format!(
            "code must be 1..={} characters",
            CODE_MAX_LEN
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(GradeError::InvalidSchema(
            "code may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(code)
}

/// Builds a workspace-defined course type. Custom types always use the
/// plain-average rules.
pub fn custom_course_type(
    code: &str,
    name: &str,
    schema: EvaluationSchema,
) -> Result<CourseType, GradeError> {
    let code = normalize_code(code)?;
    if is_builtin_code(&code) {
        return Err(GradeError::InvalidSchema(format!(
            "'{}' is a built-in course type",
            code
        )));
    }
    let name = name.trim();
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return Err(GradeError::InvalidSchema(format!(
            "name must be 1..={} characters",
            NAME_MAX_LEN
        )));
    }
    schema.validate(CourseCategory::Custom)?;
    Ok(CourseType {
        code,
        name: name.to_string(),
        category: CourseCategory::Custom,
        schema,
        builtin: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_pass_their_own_validation() {
        for ct in builtin_course_types() {
            ct.schema.validate(ct.category).expect("builtin schema");
            assert!(ct.schema.derives_practical_score(), "{}", ct.code);
        }
    }

    #[test]
    fn category_parse_round_trips_wire_names() {
        for c in [
            CourseCategory::ThreeExam,
            CourseCategory::SingleExam,
            CourseCategory::Custom,
        ] {
            assert_eq!(CourseCategory::parse(c.as_str()), Some(c));
        }
        assert_eq!(CourseCategory::parse("weighted"), None);
    }

    #[test]
    fn custom_type_rejects_builtin_code_and_duplicate_fields() {
        let schema = EvaluationSchema {
            theory_fields: vec!["written".into()],
            practice_fields: vec!["hose".into(), "hose".into()],
            averaged_practice_fields: vec!["hose".into()],
            ..Default::default()
        };
        let e = custom_course_type("ARFF_Initial", "Clash", schema.clone()).unwrap_err();
        assert!(matches!(e, GradeError::InvalidSchema(_)));

        let e = custom_course_type("hose_handling", "Hose handling", schema).unwrap_err();
        assert!(e.to_string().contains("more than once"), "{}", e);
    }

    #[test]
    fn custom_type_requires_averaged_fields_on_the_practice_sheet() {
        let schema = EvaluationSchema {
            theory_fields: vec!["written".into()],
            practice_fields: vec!["ladder".into()],
            averaged_practice_fields: vec!["hose".into()],
            ..Default::default()
        };
        assert!(custom_course_type("ladders", "Ladders", schema).is_err());

        let ok = EvaluationSchema {
            theory_fields: vec!["written".into()],
            practice_fields: vec!["ladder".into()],
            averaged_practice_fields: vec!["ladder".into()],
            ..Default::default()
        };
        let ct = custom_course_type(" Ladders ", "Ladders", ok).expect("valid");
        assert_eq!(ct.code, "ladders");
        assert_eq!(ct.category, CourseCategory::Custom);
        assert!(!ct.schema.derives_practical_score());
    }
}
