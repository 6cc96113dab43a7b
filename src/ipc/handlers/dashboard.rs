use crate::grading::{round_off_1_decimal, PASS_MARKER};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const ENTITY_COUNTS: [(&str, &str); 8] = [
    ("Students", "SELECT COUNT(*) FROM students"),
    ("Lecturers", "SELECT COUNT(*) FROM lecturers"),
    ("Departments", "SELECT COUNT(*) FROM departments"),
    ("Majors", "SELECT COUNT(*) FROM majors"),
    ("Classes", "SELECT COUNT(*) FROM academic_classes"),
    ("Courses", "SELECT COUNT(*) FROM courses"),
    ("Class Sections", "SELECT COUNT(*) FROM class_sections"),
    ("Enrollments", "SELECT COUNT(*) FROM enrollments"),
];

fn percent(part: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    round_off_1_decimal(part as f64 * 100.0 / total as f64)
}

fn handle_dashboard_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut counts = Vec::with_capacity(ENTITY_COUNTS.len());
    for (label, sql) in ENTITY_COUNTS {
        match conn.query_row(sql, [], |r| r.get::<_, i64>(0)) {
            Ok(n) => counts.push((label, n)),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    let stats: Vec<serde_json::Value> = counts
        .iter()
        .map(|(label, n)| json!({ "label": label, "count": n, "percent": percent(*n, total) }))
        .collect();

    let (graded, passed): (i64, i64) = match conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0) FROM grades",
        [PASS_MARKER],
        |r| Ok((r.get(0)?, r.get(1)?)),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "stats": stats,
            "total": total,
            "grades": {
                "count": graded,
                "passed": passed,
                "passPercent": percent(passed, graded)
            }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.stats" => Some(handle_dashboard_stats(state, req)),
        _ => None,
    }
}
