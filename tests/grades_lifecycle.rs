mod test_support;

use serde_json::json;
use test_support::{
    create_course, create_section, create_student, enroll, request_err, request_ok,
    select_workspace, spawn_sidecar, str_field, temp_dir,
};

#[test]
fn create_update_and_recompute() {
    let workspace = temp_dir("registrard-grades-lifecycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let course = create_course(&mut stdin, &mut reader, "CS301", 3.0);
    let section = create_section(&mut stdin, &mut reader, &course, "CS301-01", "2024-2025", "1", 10);
    let student = create_student(&mut stdin, &mut reader, "SV100", 2024);
    let enrollment = enroll(&mut stdin, &mut reader, &student, &section);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "grades.create",
        json!({ "input": { "enrollmentId": enrollment, "attendance": 8, "midterm": 8, "assignment": 8, "final": 8 } }),
    );
    assert_eq!(created["totalScore"], json!(8.0));
    assert_eq!(created["letterGrade"], json!("B"));
    assert_eq!(created["status"], json!("Pass"));
    assert_eq!(created["weightPolicy"], json!("standard"));
    let grade_id = str_field(&created, "gradeId");

    let dup = request_err(
        &mut stdin,
        &mut reader,
        "dup",
        "grades.create",
        json!({ "input": { "enrollmentId": enrollment, "attendance": 1, "midterm": 1, "assignment": 1, "final": 1 } }),
    );
    assert_eq!(dup, "grade_exists");

    // The rejected create did not overwrite anything.
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "grades.get",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(got["grade"]["totalScore"], json!(8.0));
    assert_eq!(got["grade"]["attendance"], json!(8.0));

    // One component changes, every derived field follows.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "update",
        "grades.update",
        json!({ "gradeId": grade_id, "patch": { "final": 10 } }),
    );
    assert_eq!(updated["totalScore"], json!(8.8));
    assert_eq!(updated["letterGrade"], json!("A"));
    assert_eq!(updated["status"], json!("Pass"));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "get2",
        "grades.get",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(got["grade"]["final"], json!(10.0));
    assert_eq!(got["grade"]["midterm"], json!(8.0));
    assert_eq!(got["grade"]["letterGrade"], json!("A"));

    // Clearing components counts them as zero.
    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "clear",
        "grades.update",
        json!({ "gradeId": grade_id, "patch": { "final": null, "midterm": null } }),
    );
    assert_eq!(cleared["totalScore"], json!(2.4));
    assert_eq!(cleared["letterGrade"], json!("F"));
    assert_eq!(cleared["status"], json!("Fail"));

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "roster",
        "sections.students",
        json!({ "sectionId": section }),
    );
    assert_eq!(roster["total"], json!(1));
    assert_eq!(roster["items"][0]["gradeId"], json!(grade_id));
    assert_eq!(roster["items"][0]["letterGrade"], json!("F"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "delete",
        "grades.delete",
        json!({ "gradeId": grade_id }),
    );
    let gone = request_err(
        &mut stdin,
        &mut reader,
        "gone",
        "grades.get",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(gone, "not_found");
}

#[test]
fn weight_policies_and_preview() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let scores = json!({ "attendance": 10, "midterm": 5, "assignment": 5, "final": 10 });

    let standard = request_ok(&mut stdin, &mut reader, "std", "grades.preview", scores.clone());
    assert_eq!(standard["totalScore"], json!(7.5));
    assert_eq!(standard["weights"]["midterm"], json!(0.3));

    let mut heavy_params = scores.clone();
    heavy_params["weightPolicy"] = json!("finalHeavy");
    let heavy = request_ok(&mut stdin, &mut reader, "heavy", "grades.preview", heavy_params);
    assert_eq!(heavy["totalScore"], json!(8.0));
    assert_eq!(heavy["weightPolicy"], json!("finalHeavy"));

    let mut custom_params = scores.clone();
    custom_params["weightPolicy"] = json!("custom");
    custom_params["customWeights"] =
        json!({ "attendance": 0.0, "midterm": 0.5, "assignment": 0.0, "final": 0.5 });
    let custom = request_ok(&mut stdin, &mut reader, "custom", "grades.preview", custom_params);
    assert_eq!(custom["totalScore"], json!(7.5));

    let mut missing = scores.clone();
    missing["weightPolicy"] = json!("custom");
    let code = request_err(&mut stdin, &mut reader, "missing", "grades.preview", missing);
    assert_eq!(code, "bad_weights");

    let mut negative = scores.clone();
    negative["weightPolicy"] = json!("custom");
    negative["customWeights"] =
        json!({ "attendance": -0.1, "midterm": 0.5, "assignment": 0.1, "final": 0.5 });
    let code = request_err(&mut stdin, &mut reader, "negative", "grades.preview", negative);
    assert_eq!(code, "bad_weights");

    // Missing components contribute zero.
    let partial = request_ok(
        &mut stdin,
        &mut reader,
        "partial",
        "grades.preview",
        json!({ "final": 10 }),
    );
    assert_eq!(partial["totalScore"], json!(4.0));
    assert_eq!(partial["letterGrade"], json!("D"));
    assert_eq!(partial["status"], json!("Fail"));
}

#[test]
fn strict_validation_is_opt_in() {
    let workspace = temp_dir("registrard-grades-strict");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let course = create_course(&mut stdin, &mut reader, "CS302", 3.0);
    let section = create_section(&mut stdin, &mut reader, &course, "CS302-01", "2024-2025", "1", 10);
    let s1 = create_student(&mut stdin, &mut reader, "SV110", 2024);
    let s2 = create_student(&mut stdin, &mut reader, "SV111", 2024);
    let e1 = enroll(&mut stdin, &mut reader, &s1, &section);
    let e2 = enroll(&mut stdin, &mut reader, &s2, &section);

    // Lenient: out-of-range values flow into the total.
    let lenient = request_ok(
        &mut stdin,
        &mut reader,
        "lenient",
        "grades.create",
        json!({ "input": { "enrollmentId": e1, "attendance": 10.5, "midterm": 10, "assignment": 10, "final": 10 } }),
    );
    assert_eq!(lenient["totalScore"], json!(10.1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "strict-on",
        "settings.update",
        json!({ "section": "grading", "patch": { "scoreValidation": "strict" } }),
    );
    for (i, bad) in [10.5, -1.0].iter().enumerate() {
        let code = request_err(
            &mut stdin,
            &mut reader,
            &format!("strict-{}", i),
            "grades.create",
            json!({ "input": { "enrollmentId": e2, "attendance": bad, "midterm": 5, "assignment": 5, "final": 5 } }),
        );
        assert_eq!(code, "score_out_of_range");
    }
    let ok = request_ok(
        &mut stdin,
        &mut reader,
        "strict-ok",
        "grades.create",
        json!({ "input": { "enrollmentId": e2, "attendance": 10, "midterm": 0, "assignment": 5, "final": 5 } }),
    );
    assert_eq!(ok["totalScore"], json!(4.0));
}

#[test]
fn cancelled_or_missing_enrollment_cannot_be_graded() {
    let workspace = temp_dir("registrard-grades-cancelled");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let course = create_course(&mut stdin, &mut reader, "CS303", 3.0);
    let section = create_section(&mut stdin, &mut reader, &course, "CS303-01", "2024-2025", "1", 10);
    let student = create_student(&mut stdin, &mut reader, "SV120", 2024);
    let enrollment = enroll(&mut stdin, &mut reader, &student, &section);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "cancel",
        "enrollments.update",
        json!({ "enrollmentId": enrollment, "patch": { "status": "Cancelled" } }),
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.create",
        json!({ "input": { "enrollmentId": enrollment, "final": 9 } }),
    );
    assert_eq!(code, "conflict");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "g2",
        "grades.create",
        json!({ "input": { "enrollmentId": "missing", "final": 9 } }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn updates_keep_the_policy_the_grade_was_computed_with() {
    let workspace = temp_dir("registrard-grades-policy");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let course = create_course(&mut stdin, &mut reader, "CS304", 3.0);
    let section = create_section(&mut stdin, &mut reader, &course, "CS304-01", "2024-2025", "1", 10);
    let s1 = create_student(&mut stdin, &mut reader, "SV130", 2024);
    let s2 = create_student(&mut stdin, &mut reader, "SV131", 2024);
    let e1 = enroll(&mut stdin, &mut reader, &s1, &section);
    let e2 = enroll(&mut stdin, &mut reader, &s2, &section);

    let heavy = request_ok(
        &mut stdin,
        &mut reader,
        "heavy",
        "grades.create",
        json!({
            "input": { "enrollmentId": e1, "attendance": 10, "midterm": 8, "assignment": 9, "final": 7 },
            "weightPolicy": "finalHeavy"
        }),
    );
    assert_eq!(heavy["totalScore"], json!(7.9));
    let heavy_id = str_field(&heavy, "gradeId");

    // Rewriting a component with its current value changes nothing.
    let same = request_ok(
        &mut stdin,
        &mut reader,
        "same",
        "grades.update",
        json!({ "gradeId": heavy_id, "patch": { "attendance": 10 } }),
    );
    assert_eq!(same["totalScore"], json!(7.9));
    assert_eq!(same["weightPolicy"], json!("finalHeavy"));
    assert_eq!(same["weights"]["final"], json!(0.5));

    // An explicit policy on the request moves the grade to it.
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "moved",
        "grades.update",
        json!({ "gradeId": heavy_id, "patch": { "attendance": 10 }, "weightPolicy": "standard" }),
    );
    assert_eq!(moved["totalScore"], json!(8.0));
    assert_eq!(moved["weightPolicy"], json!("standard"));

    let custom = request_ok(
        &mut stdin,
        &mut reader,
        "custom",
        "grades.create",
        json!({
            "input": { "enrollmentId": e2, "attendance": 0, "midterm": 6, "assignment": 0, "final": 8 },
            "weightPolicy": "custom",
            "customWeights": { "attendance": 0.0, "midterm": 0.5, "assignment": 0.0, "final": 0.5 }
        }),
    );
    assert_eq!(custom["totalScore"], json!(7.0));
    let custom_id = str_field(&custom, "gradeId");

    let custom_after = request_ok(
        &mut stdin,
        &mut reader,
        "custom-upd",
        "grades.update",
        json!({ "gradeId": custom_id, "patch": { "final": 10 } }),
    );
    assert_eq!(custom_after["totalScore"], json!(8.0));
    assert_eq!(custom_after["weightPolicy"], json!("custom"));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "custom-get",
        "grades.get",
        json!({ "gradeId": custom_id }),
    );
    assert_eq!(got["grade"]["weightPolicy"], json!("custom"));
    assert_eq!(got["grade"]["weights"]["midterm"], json!(0.5));
    assert_eq!(got["grade"]["totalScore"], json!(8.0));
}

#[test]
fn custom_weights_must_sum_to_one() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let code = request_err(
        &mut stdin,
        &mut reader,
        "ones",
        "grades.preview",
        json!({
            "attendance": 1, "midterm": 1, "assignment": 1, "final": 1,
            "weightPolicy": "custom",
            "customWeights": { "attendance": 1, "midterm": 1, "assignment": 1, "final": 1 }
        }),
    );
    assert_eq!(code, "bad_weights");
}
