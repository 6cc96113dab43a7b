use crate::db;
use crate::enrollment::EnrollmentStatus;
use crate::grading::{compute_grade, ComponentScores, ComponentWeights, GradeOutcome, WeightPolicy};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, has_key, object_param, opt_f64, opt_str, query_page, require_str, required_id,
    ListQuery, WhereBuilder,
};
use crate::ipc::types::{AppState, Request};
use crate::roster::score_from_value;
use crate::settings::{self, GradingSettings};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

const SORTS: &[(&str, &str)] = &[
    ("totalScore", "g.total_score"),
    ("letterGrade", "g.letter_grade"),
    ("updatedAt", "g.updated_at"),
    ("studentCode", "s.student_code"),
    ("sectionCode", "cs.section_code"),
];

const COLUMNS: &str = "g.id, g.enrollment_id, e.student_id, s.student_code, s.last_name, s.first_name,
     e.class_section_id, cs.section_code, c.course_code, c.course_name, c.credits,
     cs.academic_year, cs.semester,
     g.attendance_score, g.midterm_score, g.assignment_score, g.final_score,
     g.total_score, g.letter_grade, g.status, g.weight_policy, g.updated_at, g.weights_json";
const FROM: &str = "FROM grades g
     JOIN enrollments e ON e.id = g.enrollment_id
     JOIN students s ON s.id = e.student_id
     JOIN class_sections cs ON cs.id = e.class_section_id
     JOIN courses c ON c.id = cs.course_id";

const COMPONENTS: [&str; 4] = ["attendance", "midterm", "assignment", "final"];

fn grade_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let enrollment_id: String = r.get(1)?;
    let student_id: String = r.get(2)?;
    let student_code: String = r.get(3)?;
    let last_name: String = r.get(4)?;
    let first_name: String = r.get(5)?;
    let section_id: String = r.get(6)?;
    let section_code: String = r.get(7)?;
    let course_code: String = r.get(8)?;
    let course_name: String = r.get(9)?;
    let credits: f64 = r.get(10)?;
    let academic_year: String = r.get(11)?;
    let semester: String = r.get(12)?;
    let letter_grade: Option<String> = r.get(18)?;
    let status: Option<String> = r.get(19)?;
    let weight_policy: String = r.get(20)?;
    let updated_at: Option<String> = r.get(21)?;
    let weights_json: Option<String> = r.get(22)?;
    let weights = stored_policy(&weight_policy, weights_json.as_deref()).map(|p| p.weights());
    Ok(json!({
        "id": id,
        "enrollmentId": enrollment_id,
        "studentId": student_id,
        "studentCode": student_code,
        "studentName": format!("{} {}", last_name, first_name),
        "classSectionId": section_id,
        "sectionCode": section_code,
        "courseCode": course_code,
        "courseName": course_name,
        "credits": credits,
        "academicYear": academic_year,
        "semester": semester,
        "attendance": score_from_value(r.get(13)?),
        "midterm": score_from_value(r.get(14)?),
        "assignment": score_from_value(r.get(15)?),
        "final": score_from_value(r.get(16)?),
        "totalScore": score_from_value(r.get(17)?),
        "letterGrade": letter_grade,
        "status": status,
        "weightPolicy": weight_policy,
        "weights": weights,
        "updatedAt": updated_at
    }))
}

/// Reads whichever of the four components appear in `obj`; absent keys stay untouched.
fn read_components(
    obj: &serde_json::Value,
    prefix: &str,
    scores: &mut ComponentScores,
) -> Result<(), String> {
    for key in COMPONENTS {
        if !has_key(obj, key) {
            continue;
        }
        let v = opt_f64(obj, key).map_err(|m| format!("{}.{}", prefix, m))?;
        match key {
            "attendance" => scores.attendance = v,
            "midterm" => scores.midterm = v,
            "assignment" => scores.assignment = v,
            _ => scores.final_exam = v,
        }
    }
    Ok(())
}

/// Rebuilds the policy recorded on a grade row. `None` when a `custom` row
/// has no usable weight vector.
fn stored_policy(code: &str, weights_json: Option<&str>) -> Option<WeightPolicy> {
    let custom = weights_json
        .and_then(|text| serde_json::from_str::<ComponentWeights>(text).ok())
        .filter(|w| w.validate().is_ok());
    WeightPolicy::parse(code, custom)
}

/// Text for `grades.weights_json`; only custom vectors are stored.
fn weights_column(policy: &WeightPolicy) -> Option<String> {
    match policy {
        WeightPolicy::Custom(w) => serde_json::to_string(w).ok(),
        _ => None,
    }
}

fn workspace_grading(
    conn: Option<&Connection>,
    req: &Request,
) -> Result<GradingSettings, serde_json::Value> {
    match conn {
        Some(c) => settings::load_grading(c)
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None)),
        None => Ok(GradingSettings::default()),
    }
}

/// The top-level `weightPolicy` (and `customWeights` for `custom`), if the
/// request names one.
fn requested_policy(req: &Request) -> Result<Option<WeightPolicy>, serde_json::Value> {
    let code = match opt_str(&req.params, "weightPolicy") {
        Ok(v) => v,
        Err(m) => return Err(err(&req.id, "bad_params", m, None)),
    };
    let Some(code) = code else {
        return Ok(None);
    };
    let custom = match req.params.get("customWeights") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let w: ComponentWeights = match serde_json::from_value(v.clone()) {
                Ok(w) => w,
                Err(_) => {
                    return Err(err(
                        &req.id,
                        "bad_weights",
                        "customWeights must have numeric attendance, midterm, assignment, final",
                        None,
                    ))
                }
            };
            if let Err(e) = w.validate() {
                return Err(err(&req.id, e.code(), e.to_string(), None));
            }
            Some(w)
        }
    };
    match WeightPolicy::parse(&code, custom) {
        Some(p) => Ok(Some(p)),
        None if code == "custom" => Err(err(
            &req.id,
            "bad_weights",
            "weightPolicy custom requires customWeights",
            None,
        )),
        None => Err(err(
            &req.id,
            "bad_params",
            "weightPolicy must be one of: standard, finalHeavy, custom",
            None,
        )),
    }
}

/// Workspace grading settings with a per-request policy taking precedence.
fn grading_for_request(
    conn: Option<&Connection>,
    req: &Request,
) -> Result<GradingSettings, serde_json::Value> {
    let mut grading = workspace_grading(conn, req)?;
    if let Some(p) = requested_policy(req)? {
        grading.weight_policy = p;
    }
    Ok(grading)
}

fn compute_checked(
    req: &Request,
    grading: &GradingSettings,
    scores: &ComponentScores,
) -> Result<GradeOutcome, serde_json::Value> {
    if let Err(e) = grading.score_validation.check(scores) {
        return Err(err(&req.id, e.code(), e.to_string(), None));
    }
    Ok(compute_grade(scores, &grading.weight_policy.weights()))
}

fn outcome_json(outcome: &GradeOutcome, grading: &GradingSettings) -> serde_json::Value {
    json!({
        "totalScore": outcome.total_score,
        "letterGrade": outcome.letter_grade,
        "status": outcome.status,
        "weightPolicy": grading.weight_policy.code(),
        "weights": grading.weight_policy.weights()
    })
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let query = match ListQuery::parse(&req.params, SORTS, "g.updated_at") {
        Ok(q) => q,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut filter = WhereBuilder::default();
    for (key, column) in [
        ("studentId", "e.student_id"),
        ("classSectionId", "e.class_section_id"),
        ("letterGrade", "g.letter_grade"),
        ("status", "g.status"),
    ] {
        match opt_str(&req.params, key) {
            Ok(Some(v)) => filter.push(format!("{} = ?", column), [Value::Text(v)]),
            Ok(None) => {}
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }
    filter.push_search(
        query.like_pattern(),
        &["s.student_code", "s.last_name", "s.first_name", "c.course_name"],
    );

    match query_page(conn, COLUMNS, FROM, &filter, &query, grade_to_json) {
        Ok((items, total)) => ok(&req.id, json!({ "items": items, "total": total })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_id(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn
        .query_row(
            &format!("SELECT {} {} WHERE g.id = ?", COLUMNS, FROM),
            [&grade_id],
            grade_to_json,
        )
        .optional()
    {
        Ok(Some(v)) => ok(&req.id, json!({ "grade": v })),
        Ok(None) => err(&req.id, "not_found", "grade not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let mut scores = ComponentScores::default();
    if let Err(m) = read_components(&req.params, "params", &mut scores) {
        return err(&req.id, "bad_params", m, None);
    }
    let grading = match grading_for_request(state.db.as_ref(), req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    match compute_checked(req, &grading, &scores) {
        Ok(outcome) => ok(&req.id, outcome_json(&outcome, &grading)),
        Err(e) => e,
    }
}

fn handle_grades_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let input = match object_param(req, "input") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match require_str(input, "enrollmentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("input.{}", m), None),
    };
    let mut scores = ComponentScores::default();
    if let Err(m) = read_components(input, "input", &mut scores) {
        return err(&req.id, "bad_params", m, None);
    }
    let grading = match grading_for_request(Some(conn), req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let outcome = match compute_checked(req, &grading, &scores) {
        Ok(o) => o,
        Err(e) => return e,
    };

    // Immediate so a concurrent cancellation of this enrollment waits for us.
    let tx = match Transaction::new_unchecked(conn, TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let status: Option<String> = match tx
        .query_row(
            "SELECT status FROM enrollments WHERE id = ?",
            [&enrollment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    };
    match status.as_deref().map(EnrollmentStatus::parse) {
        None => {
            let _ = tx.rollback();
            return err(&req.id, "not_found", "enrollment not found", None);
        }
        Some(Some(EnrollmentStatus::Cancelled)) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "conflict",
                "cannot grade a cancelled enrollment",
                None,
            );
        }
        Some(_) => {}
    }

    let grade_id = Uuid::new_v4().to_string();
    let inserted = tx.execute(
        "INSERT INTO grades(
            id, enrollment_id, attendance_score, midterm_score, assignment_score, final_score,
            total_score, letter_grade, status, weight_policy, weights_json, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            grade_id,
            enrollment_id,
            scores.attendance,
            scores.midterm,
            scores.assignment,
            scores.final_exam,
            outcome.total_score,
            outcome.letter_grade.as_str(),
            outcome.status.as_str(),
            grading.weight_policy.code(),
            weights_column(&grading.weight_policy),
            db::now_stamp()
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            let _ = tx.rollback();
            debug!(enrollment_id = %enrollment_id, "grade already exists");
            return err(
                &req.id,
                "grade_exists",
                "enrollment already has a grade",
                Some(json!({ "enrollmentId": enrollment_id })),
            );
        }
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(
        grade_id = %grade_id,
        enrollment_id = %enrollment_id,
        total = outcome.total_score,
        letter = outcome.letter_grade.as_str(),
        "grade recorded"
    );

    let mut result = outcome_json(&outcome, &grading);
    result["gradeId"] = json!(grade_id);
    ok(&req.id, result)
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_id(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match object_param(req, "patch") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !COMPONENTS.iter().any(|k| has_key(patch, k)) && !has_key(&req.params, "weightPolicy")
    {
        return err(&req.id, "bad_params", "patch has no supported fields", None);
    }

    let stored = match conn
        .query_row(
            "SELECT attendance_score, midterm_score, assignment_score, final_score,
                    weight_policy, weights_json
             FROM grades WHERE id = ?",
            [&grade_id],
            |r| {
                let scores = ComponentScores {
                    attendance: score_from_value(r.get(0)?),
                    midterm: score_from_value(r.get(1)?),
                    assignment: score_from_value(r.get(2)?),
                    final_exam: score_from_value(r.get(3)?),
                };
                let code: String = r.get(4)?;
                let weights_json: Option<String> = r.get(5)?;
                Ok((scores, code, weights_json))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "grade not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (mut scores, stored_code, stored_weights) = stored;
    if let Err(m) = read_components(patch, "patch", &mut scores) {
        return err(&req.id, "bad_params", m, None);
    }

    // A grade keeps the policy it was computed with unless the request names another.
    let mut grading = match workspace_grading(Some(conn), req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    grading.weight_policy = match requested_policy(req) {
        Ok(Some(p)) => p,
        Ok(None) => match stored_policy(&stored_code, stored_weights.as_deref()) {
            Some(p) => p,
            None => {
                return err(
                    &req.id,
                    "conflict",
                    "stored weight policy cannot be rebuilt; pass weightPolicy explicitly",
                    Some(json!({ "weightPolicy": stored_code })),
                )
            }
        },
        Err(e) => return e,
    };
    let outcome = match compute_checked(req, &grading, &scores) {
        Ok(o) => o,
        Err(e) => return e,
    };

    // Raw and derived columns always move together.
    if let Err(e) = conn.execute(
        "UPDATE grades SET
            attendance_score = ?, midterm_score = ?, assignment_score = ?, final_score = ?,
            total_score = ?, letter_grade = ?, status = ?, weight_policy = ?, weights_json = ?,
            updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            scores.attendance,
            scores.midterm,
            scores.assignment,
            scores.final_exam,
            outcome.total_score,
            outcome.letter_grade.as_str(),
            outcome.status.as_str(),
            grading.weight_policy.code(),
            weights_column(&grading.weight_policy),
            db::now_stamp(),
            grade_id
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(
        grade_id = %grade_id,
        total = outcome.total_score,
        letter = outcome.letter_grade.as_str(),
        "grade recomputed"
    );

    let mut result = outcome_json(&outcome, &grading);
    result["gradeId"] = json!(grade_id);
    ok(&req.id, result)
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade_id = match required_id(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        Ok(0) => err(&req.id, "not_found", "grade not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.get" => Some(handle_grades_get(state, req)),
        "grades.create" => Some(handle_grades_create(state, req)),
        "grades.update" => Some(handle_grades_update(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        "grades.preview" => Some(handle_grades_preview(state, req)),
        _ => None,
    }
}
