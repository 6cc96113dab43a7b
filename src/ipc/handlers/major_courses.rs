use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_row, has_key, object_param, opt_i64, require_str, required_id, PatchBuilder,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use serde_json::json;
use tracing::info;

fn opt_bool(obj: &serde_json::Value, key: &str) -> Result<Option<bool>, String> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| format!("{} must be a boolean", key)),
    }
}

/// Semester and year slots are optional positive integers.
fn opt_slot(obj: &serde_json::Value, key: &str, prefix: &str) -> Result<Option<i64>, String> {
    match opt_i64(obj, key) {
        Ok(Some(n)) if n > 0 => Ok(Some(n)),
        Ok(Some(_)) => Err(format!("{}.{} must be a positive integer", prefix, key)),
        Ok(None) => Ok(None),
        Err(m) => Err(format!("{}.{}", prefix, m)),
    }
}

fn handle_major_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let major_id = match required_id(req, "majorId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_row(conn, req, "majors", &major_id, "major") {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT mc.course_id, c.course_code, c.course_name, c.credits, d.name,
                mc.semester, mc.year, mc.is_required
         FROM major_courses mc
         JOIN courses c ON c.id = mc.course_id
         LEFT JOIN departments d ON d.id = c.department_id
         WHERE mc.major_id = ?
         ORDER BY mc.semester IS NULL, mc.semester, mc.year, c.course_code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt.query_map([&major_id], |r| {
        Ok(json!({
            "courseId": r.get::<_, String>(0)?,
            "courseCode": r.get::<_, String>(1)?,
            "courseName": r.get::<_, String>(2)?,
            "credits": r.get::<_, f64>(3)?,
            "departmentName": r.get::<_, Option<String>>(4)?,
            "semester": r.get::<_, Option<i64>>(5)?,
            "year": r.get::<_, Option<i64>>(6)?,
            "isRequired": r.get::<_, i64>(7)? != 0
        }))
    });
    let items = match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let required_credits: f64 = items
        .iter()
        .filter(|c| c["isRequired"].as_bool().unwrap_or(false))
        .filter_map(|c| c["credits"].as_f64())
        .sum();

    ok(
        &req.id,
        json!({
            "majorId": major_id,
            "items": items,
            "total": items.len(),
            "requiredCredits": required_credits
        }),
    )
}

fn handle_major_courses_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let major_id = match require_str(input, "majorId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let course_id = match require_str(input, "courseId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let semester = match opt_slot(input, "semester", "input") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let year = match opt_slot(input, "year", "input") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let is_required = match opt_bool(input, "isRequired") {
        Ok(v) => v.unwrap_or(true),
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    if let Err(e) = ensure_row(conn, req, "majors", &major_id, "major") {
        return e;
    }
    if let Err(e) = ensure_row(conn, req, "courses", &course_id, "course") {
        return e;
    }

    match conn.execute(
        "INSERT INTO major_courses(major_id, course_id, semester, year, is_required)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![major_id, course_id, semester, year, is_required as i64],
    ) {
        Ok(_) => {
            info!(major_id = %major_id, course_id = %course_id, "curriculum course added");
            ok(&req.id, json!({ "ok": true }))
        }
        Err(e) if db::is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            "course is already in this major's curriculum",
            Some(json!({ "majorId": major_id, "courseId": course_id })),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_major_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let major_id = match required_id(req, "majorId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_id(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut set = PatchBuilder::default();
    for key in ["semester", "year"] {
        if !has_key(patch, key) {
            continue;
        }
        match opt_slot(patch, key, "patch") {
            Ok(Some(n)) => set.set(key, Value::Integer(n)),
            Ok(None) => set.set(key, Value::Null),
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }
    if has_key(patch, "isRequired") {
        match opt_bool(patch, "isRequired") {
            Ok(Some(b)) => set.set("is_required", Value::Integer(b as i64)),
            Ok(None) => {
                return err(&req.id, "bad_params", "patch.isRequired must be a boolean", None)
            }
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        }
    }
    if set.is_empty() {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }

    match set.apply_where(
        conn,
        "major_courses",
        &[("major_id", major_id.as_str()), ("course_id", course_id.as_str())],
    ) {
        Ok(0) => err(&req.id, "not_found", "curriculum course not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_major_courses_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let major_id = match required_id(req, "majorId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_id(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match conn.execute(
        "DELETE FROM major_courses WHERE major_id = ? AND course_id = ?",
        [&major_id, &course_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "curriculum course not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "major_courses" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "majorCourses.list" => Some(handle_major_courses_list(state, req)),
        "majorCourses.add" => Some(handle_major_courses_add(state, req)),
        "majorCourses.update" => Some(handle_major_courses_update(state, req)),
        "majorCourses.remove" => Some(handle_major_courses_remove(state, req)),
        _ => None,
    }
}
