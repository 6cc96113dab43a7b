mod backup;
mod db;
mod enrollment;
mod grading;
mod ipc;
mod roster;
mod settings;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "REGISTRARD_LOG";
const WORKSPACE_ENV: &str = "REGISTRARD_WORKSPACE";

/// stdout carries the protocol, so logs go to stderr.
fn init_logging() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false)
                .with_target(false),
        )
        .with(env_filter)
        .try_init();
}

fn main() {
    init_logging();

    let mut state = ipc::AppState::default();
    if let Some(path) = std::env::var_os(WORKSPACE_ENV).map(PathBuf::from) {
        if let Err(e) = state.select_workspace(&path) {
            warn!(workspace = %path.display(), error = %e, "failed to preselect workspace");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "registrard started");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                warn!(error = %e, "unparseable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
