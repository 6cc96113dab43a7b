use crate::enrollment::{self, AdmitError, EnrollmentError, EnrollmentStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_row, object_param, opt_str, query_page, require_str, required_id, ListQuery,
    WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::info;

const SORTS: &[(&str, &str)] = &[
    ("enrolledAt", "e.enrolled_at"),
    ("status", "e.status"),
    ("studentCode", "s.student_code"),
    ("sectionCode", "cs.section_code"),
];

const COLUMNS: &str = "e.id, e.status, e.enrolled_at, e.student_id, s.student_code, s.last_name,
     s.first_name, e.class_section_id, cs.section_code, c.course_code, c.course_name,
     cs.academic_year, cs.semester, g.id";
const FROM: &str = "FROM enrollments e
     JOIN students s ON s.id = e.student_id
     JOIN class_sections cs ON cs.id = e.class_section_id
     JOIN courses c ON c.id = cs.course_id
     LEFT JOIN grades g ON g.enrollment_id = e.id";

fn enrollment_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let status: String = r.get(1)?;
    let enrolled_at: String = r.get(2)?;
    let student_id: String = r.get(3)?;
    let student_code: String = r.get(4)?;
    let last_name: String = r.get(5)?;
    let first_name: String = r.get(6)?;
    let section_id: String = r.get(7)?;
    let section_code: String = r.get(8)?;
    let course_code: String = r.get(9)?;
    let course_name: String = r.get(10)?;
    let academic_year: String = r.get(11)?;
    let semester: String = r.get(12)?;
    let grade_id: Option<String> = r.get(13)?;
    Ok(json!({
        "id": id,
        "status": status,
        "enrolledAt": enrolled_at,
        "studentId": student_id,
        "studentCode": student_code,
        "studentName": format!("{} {}", last_name, first_name),
        "classSectionId": section_id,
        "sectionCode": section_code,
        "courseCode": course_code,
        "courseName": course_name,
        "academicYear": academic_year,
        "semester": semester,
        "gradeId": grade_id
    }))
}

fn admit_err(id: &str, e: AdmitError) -> serde_json::Value {
    let details = match &e {
        AdmitError::Rejected(EnrollmentError::SectionFull { capacity, occupied }) => {
            Some(json!({ "capacity": capacity, "occupied": occupied }))
        }
        _ => None,
    };
    err(id, e.code(), e.to_string(), details)
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "e.enrolled_at") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut filter = WhereBuilder::default();
    for (key, column) in [
        ("studentId", "e.student_id"),
        ("classSectionId", "e.class_section_id"),
    ] {
        match opt_str(&req.params, key) {
            Ok(Some(v)) => filter.push(format!("{} = ?", column), [Value::Text(v)]),
            Ok(None) => {}
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }
    match opt_str(&req.params, "status") {
        Ok(Some(s)) => match EnrollmentStatus::parse(&s) {
            Some(st) => filter.push("e.status = ?", [Value::Text(st.as_str().to_string())]),
            None => return err(&req.id, "bad_params", "unknown enrollment status", None),
        },
        Ok(None) => {}
        Err(m) => return err(&req.id, "bad_params", m, None),
    }
    filter.push_search(
        query.like_pattern(),
        &[
            "s.student_code",
            "s.last_name",
            "s.first_name",
            "cs.section_code",
            "c.course_name",
        ],
    );

    match query_page(conn, COLUMNS, FROM, &filter, &query, enrollment_to_json) {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let enrollment_id = match required_id(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn
        .query_row(
            &format!("SELECT {} {} WHERE e.id = ?", COLUMNS, FROM),
            [&enrollment_id],
            enrollment_to_json,
        )
        .optional()
    {
        Ok(Some(v)) => ok(&req.id, json!({ "enrollment": v })),
        Ok(None) => err(&req.id, "not_found", "enrollment not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match require_str(input, "studentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let section_id = match require_str(input, "classSectionId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let policy = match settings::load_enrollment(conn) {
        Ok(s) => s.reenrollment,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match enrollment::admit(conn, &student_id, &section_id, policy) {
        Ok(admitted) => ok(&req.id, json!(admitted)),
        Err(e) => admit_err(&req.id, e),
    }
}

fn handle_enrollments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let enrollment_id = match required_id(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let next = match require_str(patch, "status") {
        Ok(s) => match EnrollmentStatus::parse(&s) {
            Some(st) => st,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "patch.status must be one of: Active, Completed, Cancelled",
                    None,
                )
            }
        },
        Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
    };

    match enrollment::change_status(conn, &enrollment_id, next) {
        Ok(previous) => ok(
            &req.id,
            json!({ "ok": true, "previousStatus": previous, "status": next }),
        ),
        Err(e) => admit_err(&req.id, e),
    }
}

fn handle_enrollments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let enrollment_id = match required_id(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_row(conn, req, "enrollments", &enrollment_id, "enrollment") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let grades = match tx.execute(
        "DELETE FROM grades WHERE enrollment_id = ?",
        [&enrollment_id],
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "grades" })),
            );
        }
    };
    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(enrollment_id = %enrollment_id, grades, "enrollment deleted");
    ok(&req.id, json!({ "ok": true, "deletedGrades": grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.get" => Some(handle_enrollments_get(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.update" => Some(handle_enrollments_update(state, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(state, req)),
        _ => None,
    }
}
