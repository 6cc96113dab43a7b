use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, SettingsSection};
use serde_json::json;
use tracing::info;

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grading = match settings::load_section(conn, SettingsSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enrollment = match settings::load_section(conn, SettingsSection::Enrollment) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grading": grading,
            "enrollment": enrollment
        }),
    )
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SettingsSection::parse(section_raw) else {
        let known: Vec<&str> = SettingsSection::ALL.iter().map(|s| s.name()).collect();
        return err(
            &req.id,
            "bad_params",
            "unknown section",
            Some(json!({ "known": known })),
        );
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match settings::load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = settings::merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = settings::save_section(conn, section, &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section.name(), "settings updated");
    ok(&req.id, json!({ "ok": true, "section": section.name(), "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
