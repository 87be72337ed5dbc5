use crate::config;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "signedIn": state.session.is_some(),
            "chatConfigured": state.config.chat.api_key.is_some(),
        }),
    )
}

/// Opens (or creates) the workspace database and loads its config.
/// Switching workspaces always signs the current user out.
pub(super) fn open_workspace(state: &mut AppState, path: PathBuf) -> anyhow::Result<()> {
    let cfg = config::load_config(&path)?;
    let conn = db::open_db(&path)?;
    state.session = None;
    state.db = Some(conn);
    state.config = cfg;
    state.workspace = Some(path);
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, path.clone()) {
        Ok(()) => {
            tracing::info!(workspace = %path.display(), "workspace opened");
            let user_count: i64 = state
                .db
                .as_ref()
                .and_then(|c| {
                    c.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
                        .ok()
                })
                .unwrap_or(0);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "needsBootstrap": user_count == 0,
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
