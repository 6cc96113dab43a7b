use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, has_key, object_param, query_page, require_str, required_id, row_exists, ListQuery,
    PatchBuilder, WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

const SORTS: &[(&str, &str)] = &[("code", "d.code"), ("name", "d.name")];

fn handle_departments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "d.code") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let mut filter = WhereBuilder::default();
    filter.push_search(query.like_pattern(), &["d.code", "d.name"]);

    let page = query_page(
        conn,
        "d.id, d.code, d.name,
         (SELECT COUNT(*) FROM majors m WHERE m.department_id = d.id),
         (SELECT COUNT(*) FROM courses c WHERE c.department_id = d.id)",
        "FROM departments d",
        &filter,
        &query,
        |r| {
            let id: String = r.get(0)?;
            let code: String = r.get(1)?;
            let name: String = r.get(2)?;
            let major_count: i64 = r.get(3)?;
            let course_count: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "majorCount": major_count,
                "courseCount": course_count
            }))
        },
    );
    match page {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_departments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match require_str(input, "code") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let name = match require_str(input, "name") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };

    let department_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO departments(id, code, name) VALUES(?, ?, ?)",
        (&department_id, &code, &name),
    ) {
        Ok(_) => ok(&req.id, json!({ "departmentId": department_id })),
        Err(e) if db::is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            "department code already exists",
            Some(json!({ "code": code })),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_departments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let department_id = match required_id(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut set = PatchBuilder::default();
    for (key, column) in [("code", "code"), ("name", "name")] {
        if !has_key(patch, key) {
            continue;
        }
        match require_str(patch, key) {
            Ok(v) => set.set(column, Value::Text(v)),
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
        }
    }
    if set.is_empty() {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }

    match set.apply(conn, "departments", &department_id) {
        Ok(0) => err(&req.id, "not_found", "department not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) if db::is_unique_violation(&e) => {
            err(&req.id, "conflict", "department code already exists", None)
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_departments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let department_id = match required_id(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "departments", &department_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "department not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let refs: rusqlite::Result<(i64, i64, i64)> = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM majors WHERE department_id = ?1),
           (SELECT COUNT(*) FROM courses WHERE department_id = ?1),
           (SELECT COUNT(*) FROM lecturers WHERE department_id = ?1)",
        [&department_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    );
    match refs {
        Ok((0, 0, 0)) => {}
        Ok((majors, courses, lecturers)) => {
            return err(
                &req.id,
                "in_use",
                "department is referenced by majors, courses or lecturers",
                Some(json!({ "majors": majors, "courses": courses, "lecturers": lecturers })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Err(e) = conn.execute("DELETE FROM departments WHERE id = ?", [&department_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "departments" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "departments.list" => Some(handle_departments_list(state, req)),
        "departments.create" => Some(handle_departments_create(state, req)),
        "departments.update" => Some(handle_departments_update(state, req)),
        "departments.delete" => Some(handle_departments_delete(state, req)),
        _ => None,
    }
}
