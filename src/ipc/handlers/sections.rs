use crate::db;
use crate::enrollment::{occupied_seats, EnrollmentStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_row, has_key, object_param, opt_i64, opt_str, query_page, require_str,
    required_id, text_or_null, ListQuery, PatchBuilder, WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::{academic_year_start, score_from_value};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const SORTS: &[(&str, &str)] = &[
    ("sectionCode", "cs.section_code"),
    ("academicYear", "cs.academic_year"),
    ("semester", "cs.semester"),
    ("capacity", "cs.capacity"),
    ("courseCode", "c.course_code"),
    ("startDate", "cs.start_date"),
];

const ROSTER_SORTS: &[(&str, &str)] = &[
    ("studentCode", "s.student_code"),
    ("lastName", "s.last_name"),
    ("firstName", "s.first_name"),
    ("totalScore", "g.total_score"),
    ("enrolledAt", "e.enrolled_at"),
];

// Seat count must agree with enrollment::occupied_seats.
const COLUMNS: &str = "cs.id, cs.section_code, cs.course_id, c.course_code, c.course_name, c.credits,
     cs.academic_year, cs.semester, cs.capacity, cs.start_date, cs.end_date,
     (SELECT COUNT(*) FROM enrollments e WHERE e.class_section_id = cs.id AND e.status <> 'Cancelled'),
     cs.lecturer_id, l.last_name, l.first_name";
const FROM: &str = "FROM class_sections cs
     JOIN courses c ON c.id = cs.course_id
     LEFT JOIN lecturers l ON l.id = cs.lecturer_id";

fn section_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let section_code: String = r.get(1)?;
    let course_id: String = r.get(2)?;
    let course_code: String = r.get(3)?;
    let course_name: String = r.get(4)?;
    let credits: f64 = r.get(5)?;
    let academic_year: String = r.get(6)?;
    let semester: String = r.get(7)?;
    let capacity: i64 = r.get(8)?;
    let start_date: Option<String> = r.get(9)?;
    let end_date: Option<String> = r.get(10)?;
    let occupied: i64 = r.get(11)?;
    let lecturer_id: Option<String> = r.get(12)?;
    let lecturer_last: Option<String> = r.get(13)?;
    let lecturer_first: Option<String> = r.get(14)?;
    let lecturer_name = match (lecturer_last, lecturer_first) {
        (Some(last), Some(first)) => Some(format!("{} {}", last, first)),
        _ => None,
    };
    Ok(json!({
        "id": id,
        "sectionCode": section_code,
        "courseId": course_id,
        "courseCode": course_code,
        "courseName": course_name,
        "credits": credits,
        "academicYear": academic_year,
        "semester": semester,
        "capacity": capacity,
        "startDate": start_date,
        "endDate": end_date,
        "occupied": occupied,
        "seatsLeft": (capacity - occupied).max(0),
        "lecturerId": lecturer_id,
        "lecturerName": lecturer_name
    }))
}

fn parse_academic_year(obj: &serde_json::Value, prefix: &str) -> Result<String, String> {
    let year = require_str(obj, "academicYear").map_err(|m| format!("{}.{}", prefix, m))?;
    if academic_year_start(&year).is_none() {
        return Err(format!(
            "{}.academicYear must look like 2023-2024",
            prefix
        ));
    }
    Ok(year)
}

fn parse_capacity(obj: &serde_json::Value, prefix: &str) -> Result<i64, String> {
    match opt_i64(obj, "capacity") {
        Ok(Some(c)) if c > 0 => Ok(c),
        Ok(Some(_)) => Err(format!("{}.capacity must be a positive integer", prefix)),
        Ok(None) => Err(format!("{}.capacity is required", prefix)),
        Err(m) => Err(format!("{}.{}", prefix, m)),
    }
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "cs.academic_year") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut filter = WhereBuilder::default();
    for (key, column) in [
        ("courseId", "cs.course_id"),
        ("semester", "cs.semester"),
        ("academicYear", "cs.academic_year"),
        ("lecturerId", "cs.lecturer_id"),
    ] {
        match opt_str(&req.params, key) {
            Ok(Some(v)) => filter.push(format!("{} = ?", column), [Value::Text(v)]),
            Ok(None) => {}
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }
    filter.push_search(
        query.like_pattern(),
        &[
            "cs.section_code",
            "c.course_code",
            "c.course_name",
            "l.last_name",
            "l.first_name",
        ],
    );

    match query_page(conn, COLUMNS, FROM, &filter, &query, section_to_json) {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sections_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_id(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn
        .query_row(
            &format!("SELECT {} {} WHERE cs.id = ?", COLUMNS, FROM),
            [&section_id],
            section_to_json,
        )
        .optional()
    {
        Ok(Some(section)) => ok(&req.id, json!({ "section": section })),
        Ok(None) => err(&req.id, "not_found", "class section not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_code = match require_str(input, "sectionCode") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let course_id = match require_str(input, "courseId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let academic_year = match parse_academic_year(input, "input") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let semester = match require_str(input, "semester") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let capacity = match parse_capacity(input, "input") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let start_date = match opt_str(input, "startDate") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let end_date = match opt_str(input, "endDate") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let lecturer_id = match opt_str(input, "lecturerId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    if let Err(e) = ensure_row(conn, req, "courses", &course_id, "course") {
        return e;
    }
    if let Some(l) = lecturer_id.as_deref() {
        if let Err(e) = ensure_row(conn, req, "lecturers", l, "lecturer") {
            return e;
        }
    }

    let section_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO class_sections(
            id, section_code, course_id, academic_year, semester, capacity, start_date, end_date,
            lecturer_id
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            section_id,
            section_code,
            course_id,
            academic_year,
            semester,
            capacity,
            start_date,
            end_date,
            lecturer_id
        ],
    ) {
        Ok(_) => ok(&req.id, json!({ "sectionId": section_id })),
        Err(e) if db::is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            "section code already exists",
            Some(json!({ "sectionCode": section_code })),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_sections_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_id(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut set = PatchBuilder::default();
    for (key, column) in [("sectionCode", "section_code"), ("semester", "semester")] {
        if !has_key(patch, key) {
            continue;
        }
        match require_str(patch, key) {
            Ok(v) => set.set(column, Value::Text(v)),
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        }
    }
    if has_key(patch, "academicYear") {
        match parse_academic_year(patch, "patch") {
            Ok(v) => set.set("academic_year", Value::Text(v)),
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }
    for (key, column) in [("startDate", "start_date"), ("endDate", "end_date")] {
        if !has_key(patch, key) {
            continue;
        }
        match opt_str(patch, key) {
            Ok(v) => set.set(column, text_or_null(v)),
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        }
    }
    if has_key(patch, "courseId") {
        let course_id = match require_str(patch, "courseId") {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        };
        if let Err(e) = ensure_row(conn, req, "courses", &course_id, "course") {
            return e;
        }
        set.set("course_id", Value::Text(course_id));
    }
    if has_key(patch, "lecturerId") {
        let lecturer_id = match opt_str(patch, "lecturerId") {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        };
        if let Some(l) = lecturer_id.as_deref() {
            if let Err(e) = ensure_row(conn, req, "lecturers", l, "lecturer") {
                return e;
            }
        }
        set.set("lecturer_id", text_or_null(lecturer_id));
    }
    let capacity = if has_key(patch, "capacity") {
        match parse_capacity(patch, "patch") {
            Ok(c) => {
                set.set("capacity", Value::Integer(c));
                Some(c)
            }
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    } else {
        None
    };
    if set.is_empty() {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }

    // Same write lock as admission, so the seat count cannot move between the
    // check and the update.
    let tx = match Transaction::new_unchecked(conn, TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Some(capacity) = capacity {
        let occupied = match occupied_seats(&tx, &section_id) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        if capacity < occupied {
            let _ = tx.rollback();
            return err(
                &req.id,
                "conflict",
                "capacity is below the number of occupied seats",
                Some(json!({ "capacity": capacity, "occupied": occupied })),
            );
        }
    }
    match set.apply(&tx, "class_sections", &section_id) {
        Ok(0) => {
            let _ = tx.rollback();
            return err(&req.id, "not_found", "class section not found", None);
        }
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            let _ = tx.rollback();
            return err(&req.id, "conflict", "section code already exists", None);
        }
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_sections_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_id(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_row(conn, req, "class_sections", &section_id, "class section") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut removed = [0usize; 3];
    for (i, (table, sql)) in [
        (
            "grades",
            "DELETE FROM grades WHERE enrollment_id IN
               (SELECT id FROM enrollments WHERE class_section_id = ?)",
        ),
        (
            "enrollments",
            "DELETE FROM enrollments WHERE class_section_id = ?",
        ),
        ("class_sections", "DELETE FROM class_sections WHERE id = ?"),
    ]
    .into_iter()
    .enumerate()
    {
        match tx.execute(sql, [&section_id]) {
            Ok(n) => removed[i] = n,
            Err(e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_delete_failed",
                    e.to_string(),
                    Some(json!({ "table": table })),
                );
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(
        section_id = %section_id,
        grades = removed[0],
        enrollments = removed[1],
        "class section deleted"
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

/// Enrolled students of one section with their grade columns (null until graded).
fn handle_sections_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_id(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, ROSTER_SORTS, "s.student_code") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let status = match opt_str(&req.params, "status") {
        Ok(None) => None,
        Ok(Some(s)) => match EnrollmentStatus::parse(&s) {
            Some(st) => Some(st),
            None => return err(&req.id, "bad_params", "unknown enrollment status", None),
        },
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    if let Err(e) = ensure_row(conn, req, "class_sections", &section_id, "class section") {
        return e;
    }

    let mut filter = WhereBuilder::default();
    filter.push("e.class_section_id = ?", [Value::Text(section_id)]);
    if let Some(st) = status {
        filter.push("e.status = ?", [Value::Text(st.as_str().to_string())]);
    }
    filter.push_search(
        query.like_pattern(),
        &["s.student_code", "s.last_name", "s.first_name"],
    );

    let page = query_page(
        conn,
        "e.id, e.status, e.enrolled_at, s.id, s.student_code, s.last_name, s.first_name,
         g.id, g.attendance_score, g.midterm_score, g.assignment_score, g.final_score,
         g.total_score, g.letter_grade, g.status",
        "FROM enrollments e
         JOIN students s ON s.id = e.student_id
         LEFT JOIN grades g ON g.enrollment_id = e.id",
        &filter,
        &query,
        |r| {
            let enrollment_id: String = r.get(0)?;
            let status: String = r.get(1)?;
            let enrolled_at: String = r.get(2)?;
            let student_id: String = r.get(3)?;
            let student_code: String = r.get(4)?;
            let last_name: String = r.get(5)?;
            let first_name: String = r.get(6)?;
            let grade_id: Option<String> = r.get(7)?;
            Ok(json!({
                "enrollmentId": enrollment_id,
                "status": status,
                "enrolledAt": enrolled_at,
                "studentId": student_id,
                "studentCode": student_code,
                "displayName": format!("{} {}", last_name, first_name),
                "gradeId": grade_id,
                "attendance": score_from_value(r.get(8)?),
                "midterm": score_from_value(r.get(9)?),
                "assignment": score_from_value(r.get(10)?),
                "final": score_from_value(r.get(11)?),
                "totalScore": score_from_value(r.get(12)?),
                "letterGrade": r.get::<_, Option<String>>(13)?,
                "gradeStatus": r.get::<_, Option<String>>(14)?
            }))
        },
    );
    match page {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sections.list" => Some(handle_sections_list(state, req)),
        "sections.get" => Some(handle_sections_get(state, req)),
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.update" => Some(handle_sections_update(state, req)),
        "sections.delete" => Some(handle_sections_delete(state, req)),
        "sections.students" => Some(handle_sections_students(state, req)),
        _ => None,
    }
}
