use crate::auth::{self, Role, Session};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{gated, get_optional_str, get_required_str, ADMIN_ONLY};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn users_create(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;
    let full_name = get_required_str(params, "fullName")?;
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", role_raw)))?;
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must contain @"));
    }

    let taken = conn
        .query_row(
            "SELECT 1 FROM users WHERE email = ?",
            [auth::normalize_email(&email)],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .is_some();
    if taken {
        return Err(HandlerErr::new("email_taken", "email already registered"));
    }

    let user = auth::create_user(conn, &email, &password, role, &full_name)?;
    tracing::info!(user_id = %user.id, role = role.as_str(), "user created");
    Ok(json!({ "user": user }))
}

fn users_list(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let role_filter = match get_optional_str(params, "role") {
        Some(raw) => Some(
            Role::parse(&raw)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", raw)))?,
        ),
        None => None,
    };
    let mut stmt = conn
        .prepare(
            "SELECT id, email, role, full_name, created_at
             FROM users
             WHERE (?1 IS NULL OR role = ?1)
             ORDER BY role, full_name, id",
        )
        .map_err(HandlerErr::query)?;
    let users = stmt
        .query_map([role_filter.map(|r| r.as_str())], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "role": r.get::<_, String>(2)?,
                "fullName": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "users": users }))
}

fn users_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    if user_id == session.user.id {
        return Err(HandlerErr::bad_params("cannot delete the signed-in user"));
    }
    if auth::load_user(conn, &user_id)?.is_none() {
        return Err(HandlerErr::not_found("user"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    // No ON DELETE CASCADE; children first.
    let steps: &[(&str, &str)] = &[
        ("sessions", "DELETE FROM sessions WHERE user_id = ?"),
        ("user_prefs", "DELETE FROM user_prefs WHERE user_id = ?"),
        ("chat_messages", "DELETE FROM chat_messages WHERE user_id = ?"),
        ("badges", "DELETE FROM badges WHERE student_id = ?"),
        ("attendance", "DELETE FROM attendance WHERE student_id = ?"),
        ("marks", "DELETE FROM marks WHERE student_id = ?"),
        ("enrollments", "DELETE FROM enrollments WHERE student_id = ?"),
        ("courses", "UPDATE courses SET teacher_id = NULL WHERE teacher_id = ?"),
        ("users", "DELETE FROM users WHERE id = ?"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&user_id])
            .map_err(|e| HandlerErr::update(table, e))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;
    tracing::info!(user_id = %user_id, "user deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(gated(state, req, ADMIN_ONLY, users_create)),
        "users.list" => Some(gated(state, req, ADMIN_ONLY, users_list)),
        "users.delete" => Some(gated(state, req, ADMIN_ONLY, users_delete)),
        _ => None,
    }
}
