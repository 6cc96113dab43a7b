use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use tracing::{debug, warn};

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: [TryHandle; 15] = [
    handlers::core::try_handle,
    handlers::settings::try_handle,
    handlers::departments::try_handle,
    handlers::majors::try_handle,
    handlers::courses::try_handle,
    handlers::major_courses::try_handle,
    handlers::lecturers::try_handle,
    handlers::academic_classes::try_handle,
    handlers::students::try_handle,
    handlers::sections::try_handle,
    handlers::enrollments::try_handle,
    handlers::grades::try_handle,
    handlers::transcripts::try_handle,
    handlers::dashboard::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    debug!(id = %req.id, method = %req.method, "request");
    for try_handle in FAMILIES {
        if let Some(resp) = try_handle(state, &req) {
            if let Some(code) = resp.pointer("/error/code").and_then(|v| v.as_str()) {
                debug!(id = %req.id, method = %req.method, code, "request failed");
            }
            return resp;
        }
    }

    warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
