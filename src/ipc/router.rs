use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::auth::try_handle,
    handlers::users::try_handle,
    handlers::courses::try_handle,
    handlers::attendance::try_handle,
    handlers::marks::try_handle,
    handlers::reports::try_handle,
    handlers::badges::try_handle,
    handlers::chat::try_handle,
    handlers::prefs::try_handle,
    handlers::admin::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let span = tracing::debug_span!("request", id = %req.id, method = %req.method);
    let _enter = span.enter();

    let resp = HANDLERS
        .iter()
        .find_map(|try_handle| try_handle(state, &req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });

    if let Some(code) = resp
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
    {
        tracing::warn!(code, "request failed");
    } else {
        tracing::debug!("request ok");
    }
    resp
}
