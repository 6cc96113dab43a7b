use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_row, has_key, object_param, opt_str, query_page, require_str, required_id,
    text_or_null, ListQuery, PatchBuilder, WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

const SORTS: &[(&str, &str)] = &[
    ("code", "m.code"),
    ("name", "m.name"),
    ("departmentName", "d.name"),
];

fn handle_majors_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "m.code") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let department_id = match opt_str(&req.params, "departmentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut filter = WhereBuilder::default();
    if let Some(d) = department_id {
        filter.push("m.department_id = ?", [Value::Text(d)]);
    }
    filter.push_search(query.like_pattern(), &["m.code", "m.name", "d.name"]);

    let page = query_page(
        conn,
        "m.id, m.code, m.name, m.department_id, d.name",
        "FROM majors m LEFT JOIN departments d ON d.id = m.department_id",
        &filter,
        &query,
        |r| {
            let id: String = r.get(0)?;
            let code: String = r.get(1)?;
            let name: String = r.get(2)?;
            let department_id: Option<String> = r.get(3)?;
            let department_name: Option<String> = r.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
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

fn handle_majors_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let department_id = match opt_str(input, "departmentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    if let Some(d) = department_id.as_deref() {
        if let Err(e) = ensure_row(conn, req, "departments", d, "department") {
            return e;
        }
    }

    let major_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO majors(id, code, name, department_id) VALUES(?, ?, ?, ?)",
        (&major_id, &code, &name, &department_id),
    ) {
        Ok(_) => ok(&req.id, json!({ "majorId": major_id })),
        Err(e) if db::is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            "major code already exists",
            Some(json!({ "code": code })),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_majors_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let major_id = match required_id(req, "majorId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut set = PatchBuilder::default();
    for key in ["code", "name"] {
        if !has_key(patch, key) {
            continue;
        }
        match require_str(patch, key) {
            Ok(v) => set.set(key, Value::Text(v)),
            Err(m) => return err(&req.id, "bad_params", format!("patch.{}", m), None),
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

    match set.apply(conn, "majors", &major_id) {
        Ok(0) => err(&req.id, "not_found", "major not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) if db::is_unique_violation(&e) => {
            err(&req.id, "conflict", "major code already exists", None)
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_majors_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let refs = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM students WHERE major_id = ?1),
            (SELECT COUNT(*) FROM academic_classes WHERE major_id = ?1)",
        [&major_id],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
    );
    let (students, classes) = match refs {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if students > 0 || classes > 0 {
        return err(
            &req.id,
            "in_use",
            "major has students or academic classes",
            Some(json!({ "students": students, "academicClasses": classes })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut removed = [0usize; 2];
    for (slot, (table, sql)) in removed.iter_mut().zip([
        ("major_courses", "DELETE FROM major_courses WHERE major_id = ?"),
        ("majors", "DELETE FROM majors WHERE id = ?"),
    ]) {
        match tx.execute(sql, [&major_id]) {
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
        "majors.list" => Some(handle_majors_list(state, req)),
        "majors.create" => Some(handle_majors_create(state, req)),
        "majors.update" => Some(handle_majors_update(state, req)),
        "majors.delete" => Some(handle_majors_delete(state, req)),
        _ => None,
    }
}
