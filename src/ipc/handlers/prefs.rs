use crate::auth::Session;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{gated, get_required_str, ANY_ROLE};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const THEMES: &[&str] = &["light", "dark", "system"];

fn prefs_get(
    conn: &Connection,
    session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let theme: Option<String> = conn
        .query_row(
            "SELECT theme FROM user_prefs WHERE user_id = ?",
            [&session.user.id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    Ok(json!({
        "user": session.user,
        "theme": theme.unwrap_or_else(|| "system".to_string()),
    }))
}

fn prefs_set_theme(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let theme = get_required_str(params, "theme")?.to_ascii_lowercase();
    if !THEMES.contains(&theme.as_str()) {
        return Err(HandlerErr::bad_params("theme must be light, dark or system")
            .with_details(json!({ "allowed": THEMES })));
    }
    conn.execute(
        "INSERT INTO user_prefs(user_id, theme) VALUES(?, ?)
         ON CONFLICT(user_id) DO UPDATE SET theme = excluded.theme",
        (&session.user.id, &theme),
    )
    .map_err(|e| HandlerErr::update("user_prefs", e))?;
    Ok(json!({ "theme": theme }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "prefs.get" => Some(gated(state, req, ANY_ROLE, prefs_get)),
        "prefs.setTheme" => Some(gated(state, req, ANY_ROLE, prefs_set_theme)),
        _ => None,
    }
}
