use crate::auth::{self, check_route, gate, route_rule, Access, Role, Session};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{expire_session, get_required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn session_json(session: &Session) -> serde_json::Value {
    json!({
        "token": session.token,
        "user": session.user,
        "expiresAt": session.expires_at.to_rfc3339(),
    })
}

fn auth_bootstrap(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;
    let full_name = get_required_str(params, "fullName")?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let existing: i64 = tx
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(HandlerErr::query)?;
    if existing > 0 {
        return Err(HandlerErr::new(
            "already_bootstrapped",
            "workspace already has users",
        ));
    }
    let user = auth::create_user(&tx, &email, &password, Role::Admin, &full_name)?;
    tx.commit().map_err(HandlerErr::commit)?;
    tracing::info!(user_id = %user.id, "bootstrap admin created");
    Ok(json!({ "user": user }))
}

fn handle_auth_bootstrap(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match auth_bootstrap(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_auth_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let creds = get_required_str(&req.params, "email")
        .and_then(|e| get_required_str(&req.params, "password").map(|p| (e, p)));
    let (email, password) = match creds {
        Ok(v) => v,
        Err(error) => return error.response(&req.id),
    };
    match auth::login(conn, &email, &password, state.config.session.ttl_hours) {
        Ok(session) => {
            tracing::info!(user_id = %session.user.id, role = session.user.role.as_str(), "signed in");
            let result = session_json(&session);
            state.session = Some(session);
            ok(&req.id, result)
        }
        Err(e) => {
            tracing::warn!(code = e.code(), "sign-in rejected");
            HandlerErr::from(e).response(&req.id)
        }
    }
}

fn handle_auth_restore(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let token = match get_required_str(&req.params, "token") {
        Ok(v) => v,
        Err(error) => return error.response(&req.id),
    };
    match auth::restore(conn, &token) {
        Ok(session) => {
            let result = session_json(&session);
            state.session = Some(session);
            ok(&req.id, result)
        }
        Err(e) => {
            state.session = None;
            HandlerErr::from(e).response(&req.id)
        }
    }
}

fn handle_auth_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.take() else {
        return ok(&req.id, json!({ "signedOut": false }));
    };
    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = auth::logout(conn, &session.token) {
            return HandlerErr::from(e).response(&req.id);
        }
    }
    tracing::info!(user_id = %session.user.id, "signed out");
    ok(&req.id, json!({ "signedOut": true }))
}

fn handle_auth_whoami(state: &mut AppState, req: &Request) -> serde_json::Value {
    expire_session(state);
    match state.session.as_ref() {
        Some(s) => ok(
            &req.id,
            json!({ "user": s.user, "expiresAt": s.expires_at.to_rfc3339() }),
        ),
        None => ok(&req.id, json!({ "user": null })),
    }
}

fn parse_roles(v: &serde_json::Value) -> Result<Vec<Role>, HandlerErr> {
    let Some(items) = v.as_array() else {
        return Err(HandlerErr::bad_params("roles must be an array"));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(Role::parse)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", item)))
        })
        .collect()
}

fn route_check(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let path = get_required_str(params, "path")?;
    let session = state.session.as_ref();
    let access = match params.get("roles").filter(|v| !v.is_null()) {
        Some(raw) => gate(session, &parse_roles(raw)?),
        None => {
            let rule = route_rule(&path).ok_or_else(|| HandlerErr::not_found("route"))?;
            check_route(session, rule)
        }
    };
    Ok(json!({
        "path": path,
        "access": access.as_str(),
        "redirect": access.redirect(),
        "role": session.map(|s| s.user.role),
    }))
}

fn handle_route_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    expire_session(state);
    match route_check(state, &req.params) {
        Ok(result) => {
            if result.get("access").and_then(|v| v.as_str()) != Some(Access::Granted.as_str()) {
                tracing::debug!(path = ?result.get("path"), "route redirected");
            }
            ok(&req.id, result)
        }
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.bootstrap" => Some(handle_auth_bootstrap(state, req)),
        "auth.login" => Some(handle_auth_login(state, req)),
        "auth.restore" => Some(handle_auth_restore(state, req)),
        "auth.logout" => Some(handle_auth_logout(state, req)),
        "auth.whoami" => Some(handle_auth_whoami(state, req)),
        "route.check" => Some(handle_route_check(state, req)),
        _ => None,
    }
}
