use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_row, has_key, object_param, opt_i64, opt_str, parse_cohort, query_page,
    require_str, required_id, text_or_null, ListQuery, PatchBuilder, WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const SORTS: &[(&str, &str)] = &[
    ("classCode", "ac.class_code"),
    ("className", "ac.class_name"),
    ("cohort", "ac.cohort"),
    ("majorName", "m.name"),
];

const COLUMNS: &str = "ac.id, ac.class_code, ac.class_name, ac.cohort, ac.major_id, m.name,
     m.department_id, d.name, ac.lecturer_id, l.last_name, l.first_name,
     (SELECT COUNT(*) FROM students s WHERE s.academic_class_id = ac.id)";
const FROM: &str = "FROM academic_classes ac
     LEFT JOIN majors m ON m.id = ac.major_id
     LEFT JOIN departments d ON d.id = m.department_id
     LEFT JOIN lecturers l ON l.id = ac.lecturer_id";

fn class_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let class_code: String = r.get(1)?;
    let class_name: String = r.get(2)?;
    let cohort: Option<i64> = r.get(3)?;
    let major_id: Option<String> = r.get(4)?;
    let major_name: Option<String> = r.get(5)?;
    let department_id: Option<String> = r.get(6)?;
    let department_name: Option<String> = r.get(7)?;
    let lecturer_id: Option<String> = r.get(8)?;
    let lecturer_last: Option<String> = r.get(9)?;
    let lecturer_first: Option<String> = r.get(10)?;
    let student_count: i64 = r.get(11)?;
    let lecturer_name = match (lecturer_last, lecturer_first) {
        (Some(last), Some(first)) => Some(format!("{} {}", last, first)),
        _ => None,
    };
    Ok(json!({
        "id": id,
        "classCode": class_code,
        "className": class_name,
        "cohort": cohort,
        "majorId": major_id,
        "majorName": major_name,
        "departmentId": department_id,
        "departmentName": department_name,
        "lecturerId": lecturer_id,
        "lecturerName": lecturer_name,
        "studentCount": student_count
    }))
}

fn load_class(
    conn: &Connection,
    class_id: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        &format!("SELECT {} {} WHERE ac.id = ?", COLUMNS, FROM),
        [class_id],
        class_to_json,
    )
    .optional()
}

/// Checks the optional major and lecturer references of an input or patch.
/// Returns the ids that were present as keys.
fn parse_refs(
    conn: &Connection,
    req: &Request,
    obj: &serde_json::Value,
    prefix: &str,
) -> Result<[(bool, Option<String>); 2], serde_json::Value> {
    let mut out: [(bool, Option<String>); 2] = Default::default();
    for (slot, (key, table, what)) in out.iter_mut().zip([
        ("majorId", "majors", "major"),
        ("lecturerId", "lecturers", "lecturer"),
    ]) {
        if !has_key(obj, key) {
            continue;
        }
        let id = opt_str(obj, key)
            .map_err(|m| err(&req.id, "bad_params", format!("{}.{}", prefix, m), None))?;
        if let Some(v) = id.as_deref() {
            ensure_row(conn, req, table, v, what)?;
        }
        *slot = (true, id);
    }
    Ok(out)
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "ac.class_code") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let cohort = match opt_i64(&req.params, "cohort") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut filter = WhereBuilder::default();
    for (key, column) in [
        ("majorId", "ac.major_id"),
        ("departmentId", "m.department_id"),
        ("lecturerId", "ac.lecturer_id"),
    ] {
        match opt_str(&req.params, key) {
            Ok(Some(v)) => filter.push(format!("{} = ?", column), [Value::Text(v)]),
            Ok(None) => {}
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }
    if let Some(c) = cohort {
        filter.push("ac.cohort = ?", [Value::Integer(c)]);
    }
    filter.push_search(
        query.like_pattern(),
        &["ac.class_code", "ac.class_name", "CAST(ac.cohort AS TEXT)"],
    );

    match query_page(conn, COLUMNS, FROM, &filter, &query, class_to_json) {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_id(req, "academicClassId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_class(conn, &class_id) {
        Ok(Some(v)) => ok(&req.id, json!({ "academicClass": v })),
        Ok(None) => err(&req.id, "not_found", "academic class not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_code = match require_str(input, "classCode") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let class_name = match require_str(input, "className") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let cohort = match parse_cohort(input, "input") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let [(_, major_id), (_, lecturer_id)] = match parse_refs(conn, req, input, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let class_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO academic_classes(id, class_code, class_name, cohort, major_id, lecturer_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        rusqlite::params![class_id, class_code, class_name, cohort, major_id, lecturer_id],
    ) {
        Ok(_) => ok(&req.id, json!({ "academicClassId": class_id })),
        Err(e) if db::is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            "class code already exists",
            Some(json!({ "classCode": class_code })),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_id(req, "academicClassId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut set = PatchBuilder::default();
    for (key, column) in [("classCode", "class_code"), ("className", "class_name")] {
        if !has_key(patch, key) {
            continue;
        }
        match require_str(patch, key) {
            Ok(v) => set.set(column, Value::Text(v)),
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
    let refs = match parse_refs(conn, req, patch, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };
    for (column, (present, id)) in ["major_id", "lecturer_id"].into_iter().zip(refs) {
        if present {
            set.set(column, text_or_null(id));
        }
    }
    if set.is_empty() {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }

    match set.apply(conn, "academic_classes", &class_id) {
        Ok(0) => err(&req.id, "not_found", "academic class not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) if db::is_unique_violation(&e) => {
            err(&req.id, "conflict", "class code already exists", None)
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_id(req, "academicClassId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_row(conn, req, "academic_classes", &class_id, "academic class") {
        return e;
    }

    let students: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM students WHERE academic_class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if students > 0 {
        return err(
            &req.id,
            "in_use",
            "academic class has students",
            Some(json!({ "students": students })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM academic_classes WHERE id = ?", [&class_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "academic_classes" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

/// Class header plus its students ordered by first name.
fn handle_classes_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_id(req, "academicClassId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_info = match load_class(conn, &class_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "academic class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, student_code, last_name, first_name, birth_date, email, cohort, status
         FROM students
         WHERE academic_class_id = ?
         ORDER BY first_name, last_name, student_code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt.query_map([&class_id], |r| {
        let last_name: String = r.get(2)?;
        let first_name: String = r.get(3)?;
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "studentCode": r.get::<_, String>(1)?,
            "lastName": last_name,
            "firstName": first_name,
            "displayName": format!("{} {}", last_name, first_name),
            "birthDate": r.get::<_, Option<String>>(4)?,
            "email": r.get::<_, Option<String>>(5)?,
            "cohort": r.get::<_, Option<i64>>(6)?,
            "status": r.get::<_, Option<String>>(7)?
        }))
    });
    let students = match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({ "classInfo": class_info, "students": students }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "academicClasses.list" => Some(handle_classes_list(state, req)),
        "academicClasses.get" => Some(handle_classes_get(state, req)),
        "academicClasses.create" => Some(handle_classes_create(state, req)),
        "academicClasses.update" => Some(handle_classes_update(state, req)),
        "academicClasses.delete" => Some(handle_classes_delete(state, req)),
        "academicClasses.students" => Some(handle_classes_students(state, req)),
        _ => None,
    }
}
