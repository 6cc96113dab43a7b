use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_row, has_key, object_param, opt_i64, opt_str, parse_cohort, query_page,
    require_str, required_id, string_list, text_or_null, ListQuery, PatchBuilder, WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Transaction};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const SORTS: &[(&str, &str)] = &[
    ("studentCode", "s.student_code"),
    ("lastName", "s.last_name"),
    ("firstName", "s.first_name"),
    ("cohort", "s.cohort"),
    ("updatedAt", "s.updated_at"),
];

const COLUMNS: &str = "s.id, s.student_code, s.last_name, s.first_name, s.birth_date, s.email,
     s.cohort, s.major_id, m.name, s.status, s.updated_at, s.academic_class_id, ac.class_code";
const FROM: &str = "FROM students s
     LEFT JOIN majors m ON m.id = s.major_id
     LEFT JOIN academic_classes ac ON ac.id = s.academic_class_id";

const TEXT_FIELDS: [(&str, &str); 3] = [
    ("birthDate", "birth_date"),
    ("email", "email"),
    ("status", "status"),
];

fn student_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let student_code: String = r.get(1)?;
    let last_name: String = r.get(2)?;
    let first_name: String = r.get(3)?;
    let birth_date: Option<String> = r.get(4)?;
    let email: Option<String> = r.get(5)?;
    let cohort: Option<i64> = r.get(6)?;
    let major_id: Option<String> = r.get(7)?;
    let major_name: Option<String> = r.get(8)?;
    let status: Option<String> = r.get(9)?;
    let updated_at: Option<String> = r.get(10)?;
    let academic_class_id: Option<String> = r.get(11)?;
    let academic_class_code: Option<String> = r.get(12)?;
    Ok(json!({
        "id": id,
        "studentCode": student_code,
        "lastName": last_name,
        "firstName": first_name,
        "displayName": format!("{} {}", last_name, first_name),
        "birthDate": birth_date,
        "email": email,
        "cohort": cohort,
        "majorId": major_id,
        "majorName": major_name,
        "academicClassId": academic_class_id,
        "academicClassCode": academic_class_code,
        "status": status,
        "updatedAt": updated_at
    }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "s.student_code") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let major_id = match opt_str(&req.params, "majorId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let cohort = match opt_i64(&req.params, "cohort") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let academic_class_id = match opt_str(&req.params, "academicClassId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut filter = WhereBuilder::default();
    if let Some(m) = major_id {
        filter.push("s.major_id = ?", [Value::Text(m)]);
    }
    if let Some(c) = academic_class_id {
        filter.push("s.academic_class_id = ?", [Value::Text(c)]);
    }
    if let Some(c) = cohort {
        filter.push("s.cohort = ?", [Value::Integer(c)]);
    }
    filter.push_search(
        query.like_pattern(),
        &["s.student_code", "s.last_name", "s.first_name", "s.email"],
    );

    match query_page(conn, COLUMNS, FROM, &filter, &query, student_to_json) {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student = match conn
        .query_row(
            &format!("SELECT {} {} WHERE s.id = ?", COLUMNS, FROM),
            [&student_id],
            student_to_json,
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enrollment_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({ "student": student, "enrollmentCount": enrollment_count }),
    )
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_code = match require_str(input, "studentCode") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let last_name = match require_str(input, "lastName") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let first_name = match require_str(input, "firstName") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let mut text: [Option<String>; 3] = Default::default();
    for (slot, (key, _)) in text.iter_mut().zip(TEXT_FIELDS) {
        match opt_str(input, key) {
            Ok(v) => *slot = v,
            Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
        }
    }
    let [birth_date, email, status] = text;
    let cohort = match parse_cohort(input, "input") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let major_id = match opt_str(input, "majorId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    if let Some(m) = major_id.as_deref() {
        if let Err(e) = ensure_row(conn, req, "majors", m, "major") {
            return e;
        }
    }
    let academic_class_id = match opt_str(input, "academicClassId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    if let Some(c) = academic_class_id.as_deref() {
        if let Err(e) = ensure_row(conn, req, "academic_classes", c, "academic class") {
            return e;
        }
    }

    let student_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO students(
            id, student_code, last_name, first_name, birth_date, email, cohort, major_id,
            academic_class_id, status, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            student_id,
            student_code,
            last_name,
            first_name,
            birth_date,
            email,
            cohort,
            major_id,
            academic_class_id,
            status,
            db::now_stamp()
        ],
    ) {
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) if db::is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            "student code already exists",
            Some(json!({ "studentCode": student_code })),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut set = PatchBuilder::default();
    for (key, column) in [
        ("studentCode", "student_code"),
        ("lastName", "last_name"),
        ("firstName", "first_name"),
    ] {
        if !has_key(patch, key) {
            continue;
        }
        match require_str(patch, key) {
            Ok(v) => set.set(column, Value::Text(v)),
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        }
    }
    for (key, column) in TEXT_FIELDS {
        if !has_key(patch, key) {
            continue;
        }
        match opt_str(patch, key) {
            Ok(v) => set.set(column, text_or_null(v)),
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        }
    }
    if has_key(patch, "cohort") {
        match parse_cohort(patch, "patch") {
            Ok(Some(y)) => set.set("cohort", Value::Integer(y)),
            Ok(None) => set.set("cohort", Value::Null),
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }
    if has_key(patch, "majorId") {
        let major_id = match opt_str(patch, "majorId") {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        };
        if let Some(m) = major_id.as_deref() {
            if let Err(e) = ensure_row(conn, req, "majors", m, "major") {
                return e;
            }
        }
        set.set("major_id", text_or_null(major_id));
    }
    if has_key(patch, "academicClassId") {
        let academic_class_id = match opt_str(patch, "academicClassId") {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        };
        if let Some(c) = academic_class_id.as_deref() {
            if let Err(e) = ensure_row(conn, req, "academic_classes", c, "academic class") {
                return e;
            }
        }
        set.set("academic_class_id", text_or_null(academic_class_id));
    }
    if set.is_empty() {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }
    set.set("updated_at", Value::Text(db::now_stamp()));

    match set.apply(conn, "students", &student_id) {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) if db::is_unique_violation(&e) => {
            err(&req.id, "conflict", "student code already exists", None)
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_row(conn, req, "students", &student_id, "student") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let removed = match delete_student_rows(&tx, &student_id) {
        Ok(v) => v,
        Err((table, e)) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    };
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(
        student_id = %student_id,
        grades = removed[0],
        enrollments = removed[1],
        "student deleted"
    );
    ok(
        &req.id,
        json!({
            "ok": true,
            "deletedGrades": removed[0],
            "deletedEnrollments": removed[1]
        }),
    )
}

/// Ids that match no student are skipped; the rest go in one transaction.
fn handle_students_bulk_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ids = match string_list(&req.params, "studentIds") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut totals = [0usize; 3];
    for id in &ids {
        match delete_student_rows(&tx, id) {
            Ok(removed) => {
                for (t, n) in totals.iter_mut().zip(removed) {
                    *t += n;
                }
            }
            Err((table, e)) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_delete_failed",
                    e.to_string(),
                    Some(json!({ "table": table, "studentId": id })),
                );
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(
        requested = ids.len(),
        students = totals[2],
        enrollments = totals[1],
        "students bulk deleted"
    );
    ok(
        &req.id,
        json!({
            "ok": true,
            "deletedStudents": totals[2],
            "deletedEnrollments": totals[1],
            "deletedGrades": totals[0]
        }),
    )
}

/// Grades, then enrollments, then the student. Returns the three row counts
/// in that order.
fn delete_student_rows(
    tx: &Transaction<'_>,
    student_id: &str,
) -> Result<[usize; 3], (&'static str, rusqlite::Error)> {
    let mut removed = [0usize; 3];
    for (slot, (table, sql)) in removed.iter_mut().zip([
        (
            "grades",
            "DELETE FROM grades WHERE enrollment_id IN (SELECT id FROM enrollments WHERE student_id = ?)",
        ),
        ("enrollments", "DELETE FROM enrollments WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ]) {
        *slot = tx.execute(sql, [student_id]).map_err(|e| (table, e))?;
    }
    Ok(removed)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.bulkDelete" => Some(handle_students_bulk_delete(state, req)),
        _ => None,
    }
}
