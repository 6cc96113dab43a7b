use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_row, has_key, object_param, opt_f64, opt_str, query_page, require_str,
    required_id, text_or_null, ListQuery, PatchBuilder, WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

const SORTS: &[(&str, &str)] = &[
    ("courseCode", "c.course_code"),
    ("courseName", "c.course_name"),
    ("credits", "c.credits"),
    ("departmentName", "d.name"),
];

fn parse_credits(obj: &serde_json::Value, prefix: &str) -> Result<Option<f64>, String> {
    match opt_f64(obj, "credits") {
        Ok(Some(c)) if c.is_finite() && c > 0.0 => Ok(Some(c)),
        Ok(Some(_)) => Err(format!("{}.credits must be a positive number", prefix)),
        Ok(None) => Ok(None),
        Err(m) => Err(format!("{}.{}", prefix, m)),
    }
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "c.course_code") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let department_id = match opt_str(&req.params, "departmentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut filter = WhereBuilder::default();
    if let Some(d) = department_id {
        filter.push("c.department_id = ?", [Value::Text(d)]);
    }
    filter.push_search(query.like_pattern(), &["c.course_code", "c.course_name"]);

    let page = query_page(
        conn,
        "c.id, c.course_code, c.course_name, c.credits, c.department_id, d.name",
        "FROM courses c LEFT JOIN departments d ON d.id = c.department_id",
        &filter,
        &query,
        |r| {
            let id: String = r.get(0)?;
            let course_code: String = r.get(1)?;
            let course_name: String = r.get(2)?;
            let credits: f64 = r.get(3)?;
            let department_id: Option<String> = r.get(4)?;
            let department_name: Option<String> = r.get(5)?;
            Ok(json!({
                "id": id,
                "courseCode": course_code,
                "courseName": course_name,
                "credits": credits,
                "departmentId": department_id,
                "departmentName": department_name
            }))
        },
    );
    match page {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_code = match require_str(input, "courseCode") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let course_name = match require_str(input, "courseName") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let credits = match parse_credits(input, "input") {
        Ok(Some(c)) => c,
        Ok(None) => return err(&req.id, "bad_params", "input.credits is required", None),
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let department_id = match opt_str(input, "departmentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    if let Some(d) = department_id.as_deref() {
        if let Err(e) = ensure_row(conn, req, "departments", d, "department") {
            return e;
        }
    }

    let course_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO courses(id, course_code, course_name, credits, department_id)
         VALUES(?, ?, ?, ?, ?)",
        (&course_id, &course_code, &course_name, credits, &department_id),
    ) {
        Ok(_) => ok(&req.id, json!({ "courseId": course_id })),
        Err(e) if db::is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            "course code already exists",
            Some(json!({ "courseCode": course_code })),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
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
    for (key, column) in [("courseCode", "course_code"), ("courseName", "course_name")] {
        if !has_key(patch, key) {
            continue;
        }
        match require_str(patch, key) {
            Ok(v) => set.set(column, Value::Text(v)),
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        }
    }
    if has_key(patch, "credits") {
        match parse_credits(patch, "patch") {
            Ok(Some(c)) => set.set("credits", Value::Real(c)),
            Ok(None) => return err(&req.id, "bad_params", "patch.credits must not be null", None),
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }
    if has_key(patch, "departmentId") {
        let department_id = match opt_str(patch, "departmentId") {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        };
        if let Some(d) = department_id.as_deref() {
            if let Err(e) = ensure_row(conn, req, "departments", d, "department") {
                return e;
            }
        }
        set.set("department_id", text_or_null(department_id));
    }
    if set.is_empty() {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }

    match set.apply(conn, "courses", &course_id) {
        Ok(0) => err(&req.id, "not_found", "course not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) if db::is_unique_violation(&e) => {
            err(&req.id, "conflict", "course code already exists", None)
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match required_id(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_row(conn, req, "courses", &course_id, "course") {
        return e;
    }

    let sections: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM class_sections WHERE course_id = ?",
        [&course_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if sections > 0 {
        return err(
            &req.id,
            "in_use",
            "course has class sections",
            Some(json!({ "sections": sections })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut removed = [0usize; 2];
    for (slot, (table, sql)) in removed.iter_mut().zip([
        ("major_courses", "DELETE FROM major_courses WHERE course_id = ?"),
        ("courses", "DELETE FROM courses WHERE id = ?"),
    ]) {
        match tx.execute(sql, [&course_id]) {
            Ok(n) => *slot = n,
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
    ok(&req.id, json!({ "ok": true, "removedCurriculumCourses": removed[0] }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        _ => None,
    }
}
