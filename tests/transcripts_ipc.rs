mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{
    create_course, create_section, create_student, enroll, request_err, request_ok,
    select_workspace, spawn_sidecar, temp_dir,
};

fn graded(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student: &str,
    section: &str,
    score: f64,
) {
    let enrollment = enroll(stdin, reader, student, section);
    let _ = request_ok(
        stdin,
        reader,
        "grade",
        "grades.create",
        json!({ "input": {
            "enrollmentId": enrollment,
            "attendance": score,
            "midterm": score,
            "assignment": score,
            "final": score
        } }),
    );
}

#[test]
fn transcript_buckets_averages_and_year_filter() {
    let workspace = temp_dir("registrard-transcripts");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let c3 = create_course(&mut stdin, &mut reader, "TX3", 3.0);
    let c4 = create_course(&mut stdin, &mut reader, "TX4", 4.0);
    let c2 = create_course(&mut stdin, &mut reader, "TX2", 2.0);
    // Created out of order on purpose; buckets sort by year then 1 < 2 < Hè.
    let later = create_section(&mut stdin, &mut reader, &c2, "TX2-01", "2024-2025", "1", 30);
    let second = create_section(&mut stdin, &mut reader, &c4, "TX4-01", "2023-2024", "2", 30);
    let first = create_section(&mut stdin, &mut reader, &c3, "TX3-01", "2023-2024", "1", 30);
    let student = create_student(&mut stdin, &mut reader, "SV200", 2023);

    graded(&mut stdin, &mut reader, &student, &first, 8.0);
    graded(&mut stdin, &mut reader, &student, &second, 6.0);
    graded(&mut stdin, &mut reader, &student, &later, 4.0);

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "all",
        "transcripts.open",
        json!({ "studentId": student }),
    );
    let summary = &all["summary"];
    let buckets = summary["buckets"].as_array().expect("buckets");
    assert_eq!(buckets.len(), 3);
    assert_eq!(buckets[0]["academicYear"], json!("2023-2024"));
    assert_eq!(buckets[0]["semester"], json!("1"));
    assert_eq!(buckets[1]["semester"], json!("2"));
    assert_eq!(buckets[2]["academicYear"], json!("2024-2025"));
    assert_eq!(summary["averageRounded"], json!(6.2));
    assert_eq!(summary["totalCredits"], json!(9.0));
    assert_eq!(summary["creditsPassed"], json!(7.0));
    assert_eq!(summary["creditsFailed"], json!(2.0));
    assert_eq!(summary["standing"], json!("Average"));
    assert_eq!(all["scope"], json!({ "kind": "program" }));
    assert_eq!(all["yearOptions"][0], json!("2023-2024"));
    assert_eq!(all["student"]["cohort"], json!(2023));

    // (8*3 + 6*4) / 7
    let year1 = request_ok(
        &mut stdin,
        &mut reader,
        "y1",
        "transcripts.open",
        json!({ "studentId": student, "academicYear": "2023-2024" }),
    );
    assert_eq!(year1["summary"]["buckets"].as_array().map(|b| b.len()), Some(2));
    assert_eq!(year1["summary"]["averageRounded"], json!(6.9));
    assert_eq!(year1["summary"]["standing"], json!("Average"));
    assert_eq!(year1["scope"], json!({ "kind": "year", "number": 1 }));

    let year2 = request_ok(
        &mut stdin,
        &mut reader,
        "y2",
        "transcripts.open",
        json!({ "studentId": student, "academicYear": "2024-2025" }),
    );
    assert_eq!(year2["summary"]["averageRounded"], json!(4.0));
    assert_eq!(year2["summary"]["standing"], json!("Weak"));
    assert_eq!(year2["scope"], json!({ "kind": "year", "number": 2 }));

    let before = request_err(
        &mut stdin,
        &mut reader,
        "before",
        "transcripts.open",
        json!({ "studentId": student, "academicYear": "2022-2023" }),
    );
    assert_eq!(before, "bad_params");

    // Same input, same output.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "again",
        "transcripts.open",
        json!({ "studentId": student }),
    );
    assert_eq!(again["summary"], all["summary"]);
}

#[test]
fn empty_record_is_zero_and_weak() {
    let workspace = temp_dir("registrard-transcripts-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let student = create_student(&mut stdin, &mut reader, "SV300", 2024);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "open",
        "transcripts.open",
        json!({ "studentId": student }),
    );
    assert_eq!(res["summary"]["average"], json!(0.0));
    assert_eq!(res["summary"]["standing"], json!("Weak"));
    assert_eq!(res["summary"]["buckets"], json!([]));

    let missing = request_err(
        &mut stdin,
        &mut reader,
        "missing",
        "transcripts.open",
        json!({ "studentId": "nobody" }),
    );
    assert_eq!(missing, "not_found");
}
