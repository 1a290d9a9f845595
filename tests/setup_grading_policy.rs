mod test_support;

use serde_json::json;
use test_support::{num_field, request_err, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn grading_policy_changes_apply_on_recalculation() {
    let workspace = temp_dir("academyd-grading-policy");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(setup.pointer("/grading/passMark"), Some(&json!(7.0)));
    assert_eq!(setup.pointer("/grading/strictInput"), Some(&json!(false)));
    assert_eq!(setup.pointer("/reports/decimalPlaces"), Some(&json!(2)));

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "name": "Refresher", "courseType": "arff_refresher" }),
    );
    let course_id = str_field(&course, "courseId");
    let steady = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "courseId": course_id, "lastName": "Steady", "firstName": "Sol" }),
    );
    let typo = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "courseId": course_id, "lastName": "Typo", "firstName": "Tess" }),
    );
    let steady_id = str_field(&steady, "studentId");
    let typo_id = str_field(&typo, "studentId");

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.save",
        json!({
            "studentId": steady_id,
            "grades": { "exam": "7", "pt_score": "7", "equipment_check": "7", "rescue_drill": "7" }
        }),
    );
    assert_eq!(str_field(&saved, "enrollmentStatus"), "approved");
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.save",
        json!({ "studentId": typo_id, "grades": { "exam": "abc" } }),
    );
    assert_eq!(saved.get("invalidFields"), Some(&json!(["exam"])));

    for (i, patch) in [
        json!({ "passMark": 11 }),
        json!({ "timePenaltyStepSeconds": 0 }),
        json!({ "strictInput": "yes" }),
        json!({ "curve": 1 }),
    ]
    .into_iter()
    .enumerate()
    {
        assert_eq!(
            request_err(
                &mut stdin,
                &mut reader,
                &format!("bad-{}", i),
                "setup.update",
                json!({ "section": "grading", "patch": patch }),
            ),
            "bad_params"
        );
    }
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "setup.update",
            json!({ "section": "payroll", "patch": {} }),
        ),
        "bad_params"
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "setup.update",
        json!({ "section": "grading", "patch": { "passMark": 8 } }),
    );
    let recalc = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.recalculateCourse",
        json!({ "courseId": course_id }),
    );
    assert_eq!(num_field(&recalc, "updated"), 2.0);
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.list",
        json!({ "courseId": course_id }),
    );
    assert_eq!(
        listed.pointer("/students/0/status"),
        Some(&json!("failed"))
    );

    // Stored text that strict input would reject is reported, not fatal.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "setup.update",
        json!({ "section": "grading", "patch": { "strictInput": true } }),
    );
    let recalc = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.recalculateCourse",
        json!({ "courseId": course_id }),
    );
    assert_eq!(num_field(&recalc, "updated"), 1.0);
    let skipped = recalc
        .get("skipped")
        .and_then(|v| v.as_array())
        .expect("skipped");
    assert_eq!(skipped.len(), 1);
    assert_eq!(str_field(&skipped[0], "studentId"), typo_id);
    assert_eq!(str_field(&skipped[0], "code"), "invalid_input");

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "14",
            "grades.save",
            json!({ "studentId": typo_id, "grades": { "exam": "abc" } }),
        ),
        "invalid_input"
    );

    let setup = request_ok(&mut stdin, &mut reader, "15", "setup.get", json!({}));
    assert_eq!(setup.pointer("/grading/passMark"), Some(&json!(8.0)));
    assert_eq!(setup.pointer("/grading/examFloor"), Some(&json!(5.0)));
    assert_eq!(setup.pointer("/grading/strictInput"), Some(&json!(true)));
}
