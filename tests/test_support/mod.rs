#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_registrard");
    let mut child = Command::new(exe)
        .env_remove("REGISTRARD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn registrard");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Returns the error code; panics if the call succeeded.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|s| s.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

pub fn select_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

pub fn create_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    code: &str,
    credits: f64,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "seed-course",
        "courses.create",
        json!({ "input": { "courseCode": code, "courseName": format!("Course {}", code), "credits": credits } }),
    );
    str_field(&res, "courseId")
}

pub fn create_section(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    course_id: &str,
    code: &str,
    academic_year: &str,
    semester: &str,
    capacity: i64,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "seed-section",
        "sections.create",
        json!({ "input": {
            "sectionCode": code,
            "courseId": course_id,
            "academicYear": academic_year,
            "semester": semester,
            "capacity": capacity
        } }),
    );
    str_field(&res, "sectionId")
}

pub fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    code: &str,
    cohort: i64,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "seed-student",
        "students.create",
        json!({ "input": {
            "studentCode": code,
            "lastName": "Nguyen",
            "firstName": code,
            "cohort": cohort
        } }),
    );
    str_field(&res, "studentId")
}

pub fn enroll(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
    section_id: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "seed-enroll",
        "enrollments.create",
        json!({ "input": { "studentId": student_id, "classSectionId": section_id } }),
    );
    str_field(&res, "enrollmentId")
}
