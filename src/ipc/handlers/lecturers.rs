use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, ensure_row, has_key, object_param, opt_str, query_page, require_str, required_id,
    string_list, text_or_null, ListQuery, PatchBuilder, WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Transaction};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const SORTS: &[(&str, &str)] = &[
    ("lecturerCode", "l.lecturer_code"),
    ("lastName", "l.last_name"),
    ("firstName", "l.first_name"),
    ("position", "l.position"),
    ("departmentName", "d.name"),
];

const COLUMNS: &str = "l.id, l.lecturer_code, l.last_name, l.first_name, l.gender, l.birth_date,
     l.phone, l.email, l.address, l.position, l.department_id, d.name";
const FROM: &str = "FROM lecturers l LEFT JOIN departments d ON d.id = l.department_id";

const TEXT_FIELDS: [(&str, &str); 6] = [
    ("gender", "gender"),
    ("birthDate", "birth_date"),
    ("phone", "phone"),
    ("email", "email"),
    ("address", "address"),
    ("position", "position"),
];

fn lecturer_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let lecturer_code: String = r.get(1)?;
    let last_name: String = r.get(2)?;
    let first_name: String = r.get(3)?;
    let department_id: Option<String> = r.get(10)?;
    let department_name: Option<String> = r.get(11)?;
    let mut out = json!({
        "id": id,
        "lecturerCode": lecturer_code,
        "lastName": last_name,
        "firstName": first_name,
        "displayName": format!("{} {}", last_name, first_name),
        "departmentId": department_id,
        "departmentName": department_name
    });
    for (i, (key, _)) in TEXT_FIELDS.iter().enumerate() {
        let v: Option<String> = r.get(4 + i)?;
        out[*key] = json!(v);
    }
    Ok(out)
}

fn handle_lecturers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "l.lecturer_code") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut filter = WhereBuilder::default();
    for (key, column) in [
        ("departmentId", "l.department_id"),
        ("gender", "l.gender"),
        ("position", "l.position"),
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
            "l.lecturer_code",
            "l.last_name",
            "l.first_name",
            "l.email",
            "l.phone",
            "l.position",
        ],
    );

    match query_page(conn, COLUMNS, FROM, &filter, &query, lecturer_to_json) {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_lecturers_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lecturer_id = match required_id(req, "lecturerId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let lecturer = match conn
        .query_row(
            &format!("SELECT {} {} WHERE l.id = ?", COLUMNS, FROM),
            [&lecturer_id],
            lecturer_to_json,
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "lecturer not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let counts = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM class_sections WHERE lecturer_id = ?1),
            (SELECT COUNT(*) FROM academic_classes WHERE lecturer_id = ?1)",
        [&lecturer_id],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
    );
    let (sections, classes) = match counts {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({ "lecturer": lecturer, "sectionCount": sections, "classCount": classes }),
    )
}

fn handle_lecturers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut required: [String; 3] = Default::default();
    for (slot, key) in required
        .iter_mut()
        .zip(["lecturerCode", "lastName", "firstName"])
    {
        match require_str(input, key) {
            Ok(v) => *slot = v,
            Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
        }
    }
    let [lecturer_code, last_name, first_name] = required;
    let mut text: [Option<String>; 6] = Default::default();
    for (slot, (key, _)) in text.iter_mut().zip(TEXT_FIELDS) {
        match opt_str(input, key) {
            Ok(v) => *slot = v,
            Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
        }
    }
    let [gender, birth_date, phone, email, address, position] = text;
    let department_id = match opt_str(input, "departmentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    if let Some(d) = department_id.as_deref() {
        if let Err(e) = ensure_row(conn, req, "departments", d, "department") {
            return e;
        }
    }

    let lecturer_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO lecturers(
            id, lecturer_code, last_name, first_name, gender, birth_date, phone, email, address,
            position, department_id
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            lecturer_id,
            lecturer_code,
            last_name,
            first_name,
            gender,
            birth_date,
            phone,
            email,
            address,
            position,
            department_id
        ],
    ) {
        Ok(_) => ok(&req.id, json!({ "lecturerId": lecturer_id })),
        Err(e) if db::is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            "lecturer code already exists",
            Some(json!({ "lecturerCode": lecturer_code })),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_lecturers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lecturer_id = match required_id(req, "lecturerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut set = PatchBuilder::default();
    for (key, column) in [
        ("lecturerCode", "lecturer_code"),
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

    match set.apply(conn, "lecturers", &lecturer_id) {
        Ok(0) => err(&req.id, "not_found", "lecturer not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) if db::is_unique_violation(&e) => {
            err(&req.id, "conflict", "lecturer code already exists", None)
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

/// Unassigns the lecturer from sections and classes, then deletes the row.
/// Returns (lecturers deleted, sections unassigned, classes unassigned).
fn delete_lecturer_rows(
    tx: &Transaction<'_>,
    lecturer_id: &str,
) -> Result<[usize; 3], (&'static str, rusqlite::Error)> {
    let sections = tx
        .execute(
            "UPDATE class_sections SET lecturer_id = NULL WHERE lecturer_id = ?",
            [lecturer_id],
        )
        .map_err(|e| ("class_sections", e))?;
    let classes = tx
        .execute(
            "UPDATE academic_classes SET lecturer_id = NULL WHERE lecturer_id = ?",
            [lecturer_id],
        )
        .map_err(|e| ("academic_classes", e))?;
    let deleted = tx
        .execute("DELETE FROM lecturers WHERE id = ?", [lecturer_id])
        .map_err(|e| ("lecturers", e))?;
    Ok([deleted, sections, classes])
}

fn handle_lecturers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let lecturer_id = match required_id(req, "lecturerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_row(conn, req, "lecturers", &lecturer_id, "lecturer") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let changed = match delete_lecturer_rows(&tx, &lecturer_id) {
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
    info!(lecturer_id = %lecturer_id, sections = changed[1], classes = changed[2], "lecturer deleted");
    ok(
        &req.id,
        json!({
            "ok": true,
            "unassignedSections": changed[1],
            "unassignedClasses": changed[2]
        }),
    )
}

fn handle_lecturers_bulk_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let ids = match string_list(&req.params, "lecturerIds") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut totals = [0usize; 3];
    for id in &ids {
        match delete_lecturer_rows(&tx, id) {
            Ok(changed) => {
                for (t, c) in totals.iter_mut().zip(changed) {
                    *t += c;
                }
            }
            Err((table, e)) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_delete_failed",
                    e.to_string(),
                    Some(json!({ "table": table, "lecturerId": id })),
                );
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(requested = ids.len(), deleted = totals[0], "lecturers bulk deleted");
    ok(
        &req.id,
        json!({
            "ok": true,
            "deletedLecturers": totals[0],
            "unassignedSections": totals[1],
            "unassignedClasses": totals[2]
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lecturers.list" => Some(handle_lecturers_list(state, req)),
        "lecturers.get" => Some(handle_lecturers_get(state, req)),
        "lecturers.create" => Some(handle_lecturers_create(state, req)),
        "lecturers.update" => Some(handle_lecturers_update(state, req)),
        "lecturers.delete" => Some(handle_lecturers_delete(state, req)),
        "lecturers.bulkDelete" => Some(handle_lecturers_bulk_delete(state, req)),
        _ => None,
    }
}
