mod test_support;

use serde_json::json;
use test_support::{num_field, request_err, request_ok, spawn_sidecar, str_field, temp_dir};

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}

#[test]
fn three_exam_best_three_with_recovery_and_floor() {
    let workspace = temp_dir("academyd-three-exam");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.evaluate",
        json!({
            "courseType": "arff_initial",
            "grades": {
                "exam1": "8", "exam2": "6", "exam3": "7", "recovery": "9",
                "pt_score": "8", "equipment_check": "9", "rescue_drill": "7"
            }
        }),
    );
    assert_close(num_field(&eval, "finalTheory"), 8.0);
    assert_close(num_field(&eval, "finalPractical"), 8.0);
    assert_close(num_field(&eval, "finalGrade"), 8.0);
    assert_eq!(str_field(&eval, "enrollmentStatus"), "approved");

    // A recovery score does not rescue a main exam under the floor.
    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.evaluate",
        json!({
            "courseType": "arff_initial",
            "grades": {
                "exam1": "4", "exam2": "10", "exam3": "10", "recovery": "10",
                "pt_score": "10", "equipment_check": "10", "rescue_drill": "10"
            }
        }),
    );
    assert_close(num_field(&eval, "finalGrade"), 10.0);
    assert_eq!(str_field(&eval, "enrollmentStatus"), "failed");
}

#[test]
fn single_exam_uses_the_better_attempt_and_gates_on_theory() {
    let workspace = temp_dir("academyd-single-exam");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let practice = json!({ "pt_score": "10", "equipment_check": "10", "rescue_drill": "10" });
    let with = |extra: serde_json::Value| {
        let mut g = practice.clone();
        for (k, v) in extra.as_object().expect("object") {
            g[k] = v.clone();
        }
        json!({ "courseType": "arff_refresher", "grades": g })
    };

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.evaluate",
        with(json!({ "exam": "6", "recovery": "8" })),
    );
    assert_close(num_field(&eval, "finalTheory"), 8.0);
    assert_close(num_field(&eval, "finalGrade"), 9.0);
    assert_eq!(str_field(&eval, "enrollmentStatus"), "approved");

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.evaluate",
        with(json!({ "exam": "4", "recovery": "9" })),
    );
    assert_eq!(str_field(&eval, "enrollmentStatus"), "failed");

    // Final grade clears the pass mark but theory alone does not.
    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.evaluate",
        with(json!({ "exam": "6.5" })),
    );
    assert_close(num_field(&eval, "finalGrade"), 8.25);
    assert_eq!(str_field(&eval, "enrollmentStatus"), "failed");
}

#[test]
fn status_is_kept_without_grades_and_for_locked_students() {
    let workspace = temp_dir("academyd-status-guard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.evaluate",
        json!({ "courseType": "arff_initial", "grades": {}, "status": "pending" }),
    );
    assert_eq!(str_field(&eval, "enrollmentStatus"), "pending");

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.evaluate",
        json!({
            "courseType": "arff_initial",
            "grades": { "exam1": "0", "exam2": 0 },
            "status": "enrolled"
        }),
    );
    assert_eq!(str_field(&eval, "enrollmentStatus"), "enrolled");

    let eval = request_ok(
        &mut stdin,
        &mut reader,
        "3b",
        "grades.evaluate",
        json!({ "courseType": "arff_initial", "grades": { "remarks": "late" } }),
    );
    assert_eq!(str_field(&eval, "enrollmentStatus"), "enrolled");

    for (i, locked) in ["withdrawn", "cancelled"].iter().enumerate() {
        let eval = request_ok(
            &mut stdin,
            &mut reader,
            &format!("locked-{}", i),
            "grades.evaluate",
            json!({
                "courseType": "arff_refresher",
                "grades": {
                    "exam": "10", "pt_score": "10",
                    "equipment_check": "10", "rescue_drill": "10"
                },
                "status": locked
            }),
        );
        assert_close(num_field(&eval, "finalGrade"), 10.0);
        assert_eq!(str_field(&eval, "enrollmentStatus"), *locked);
    }
}

#[test]
fn apply_field_change_derives_the_practical_test_score() {
    let workspace = temp_dir("academyd-derived-score");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let change = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.applyFieldChange",
        json!({
            "courseType": "arff_initial",
            "grades": { "pt_time1": "1:45" },
            "field": "pt_time2",
            "value": "1:20"
        }),
    );
    assert_eq!(str_field(&change, "derivedField"), "pt_score");
    assert_eq!(change.pointer("/grades/pt_score"), Some(&json!("10.00")));

    // Error counts keep digits only; each error costs half a point.
    let grades = change.get("grades").cloned().expect("grades");
    let change = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.applyFieldChange",
        json!({
            "courseType": "arff_initial",
            "grades": grades,
            "field": "pt_errors",
            "value": "2a"
        }),
    );
    assert_eq!(change.pointer("/grades/pt_errors"), Some(&json!("2")));
    assert_eq!(change.pointer("/grades/pt_score"), Some(&json!("9.00")));
    assert_close(num_field(&change, "finalPractical"), 3.0);
    assert_close(num_field(&change, "finalGrade"), 1.5);
    assert_eq!(str_field(&change, "enrollmentStatus"), "failed");

    // 115s best time: two started 10s steps over 90s, plus one error.
    let change = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.applyFieldChange",
        json!({
            "courseType": "arff_refresher",
            "grades": { "pt_time1": "2:30", "pt_errors": "1" },
            "field": "pt_time2",
            "value": "1:55"
        }),
    );
    assert_eq!(change.pointer("/grades/pt_score"), Some(&json!("7.50")));

    // No usable attempt time leaves the score alone.
    let change = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.applyFieldChange",
        json!({
            "courseType": "arff_initial",
            "grades": { "pt_time1": "abc", "pt_time2": "1:00" },
            "field": "pt_time2",
            "value": ""
        }),
    );
    assert!(change.get("derivedField").is_some_and(|v| v.is_null()));
    assert!(change.pointer("/grades/pt_score").is_none());
    assert!(change.pointer("/grades/pt_time2").is_none());
}

#[test]
fn invalid_text_is_coerced_then_rejected_under_strict_input() {
    let workspace = temp_dir("academyd-strict-input");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let params = json!({
        "courseType": "arff_initial",
        "grades": { "exam2": "9" },
        "field": "exam1",
        "value": "abc"
    });
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.applyFieldChange",
        params.clone(),
    );
    assert_eq!(first.get("invalidFields"), Some(&json!(["exam1"])));
    assert_close(num_field(&first, "finalTheory"), 3.0);

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.applyFieldChange",
        params.clone(),
    );
    assert_eq!(first, again);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "grading", "patch": { "strictInput": true } }),
    );
    assert_eq!(
        request_err(&mut stdin, &mut reader, "5", "grades.applyFieldChange", params),
        "invalid_input"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "6",
            "grades.applyFieldChange",
            json!({ "courseType": "arff_initial", "field": "exam9", "value": "5" }),
        ),
        "unknown_field"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "7",
            "grades.evaluate",
            json!({ "courseType": "arff_initial", "grades": { "bogus": "1" } }),
        ),
        "unknown_field"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "grades.evaluate",
            json!({ "courseType": "nope", "grades": {} }),
        ),
        "not_found"
    );
}
