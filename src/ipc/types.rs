use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Deserialize;
use tracing::info;

use crate::db;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    /// Opens (creating if needed) the workspace database and makes it current.
    /// The previous workspace stays selected if opening fails.
    pub fn select_workspace(&mut self, path: &Path) -> anyhow::Result<()> {
        let conn = db::open_db(path)?;
        self.workspace = Some(path.to_path_buf());
        self.db = Some(conn);
        info!(workspace = %path.display(), "workspace selected");
        Ok(())
    }
}
