use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_id};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, academic_year_start};
use chrono::Datelike;
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::debug;

struct StudentHeader {
    student_code: String,
    display_name: String,
    cohort: Option<i64>,
    major_name: Option<String>,
}

fn handle_transcripts_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match opt_str(&req.params, "academicYear") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let header = match conn
        .query_row(
            "SELECT s.student_code, s.last_name, s.first_name, s.cohort, m.name
             FROM students s LEFT JOIN majors m ON m.id = s.major_id
             WHERE s.id = ?",
            [&student_id],
            |r| {
                let last_name: String = r.get(1)?;
                let first_name: String = r.get(2)?;
                Ok(StudentHeader {
                    student_code: r.get(0)?,
                    display_name: format!("{} {}", last_name, first_name),
                    cohort: r.get(3)?,
                    major_name: r.get(4)?,
                })
            },
        )
        .optional()
    {
        Ok(Some(h)) => h,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(year) = academic_year.as_deref() {
        let Some(start) = academic_year_start(year) else {
            return err(
                &req.id,
                "bad_params",
                "academicYear must look like 2023-2024",
                None,
            );
        };
        if let Some(cohort) = header.cohort {
            if start < cohort {
                return err(
                    &req.id,
                    "bad_params",
                    "academicYear is before the student's cohort",
                    Some(json!({ "academicYear": year, "cohort": cohort })),
                );
            }
        }
    }

    let rows = match roster::load_student_rows(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let summary = roster::aggregate(&rows, academic_year.as_deref());
    let year_options = match header.cohort {
        Some(cohort) => roster::year_options(cohort, i64::from(chrono::Local::now().year())),
        None => {
            let mut years: Vec<String> = rows.iter().map(|r| r.academic_year.clone()).collect();
            years.sort();
            years.dedup();
            years
        }
    };
    let scope = roster::report_scope(academic_year.as_deref(), header.cohort);
    debug!(
        student_id = %student_id,
        rows = rows.len(),
        buckets = summary.buckets.len(),
        "transcript aggregated"
    );

    ok(
        &req.id,
        json!({
            "student": {
                "id": student_id,
                "studentCode": header.student_code,
                "displayName": header.display_name,
                "cohort": header.cohort,
                "majorName": header.major_name
            },
            "yearOptions": year_options,
            "scope": scope,
            "summary": summary
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "transcripts.open" => Some(handle_transcripts_open(state, req)),
        _ => None,
    }
}
