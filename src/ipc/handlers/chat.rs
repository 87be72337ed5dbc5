use crate::auth::Session;
use crate::chat::{self, ChatClient, ChatTurn, Speaker};
use crate::config::ChatConfig;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{gated, get_required_str, ANY_ROLE};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

const MAX_MESSAGE_CHARS: usize = 4000;

fn append_message(
    conn: &Connection,
    user_id: &str,
    speaker: Speaker,
    content: &str,
) -> Result<i64, HandlerErr> {
    let seq: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM chat_messages WHERE user_id = ?",
            [user_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    conn.execute(
        "INSERT INTO chat_messages(id, user_id, seq, role, content, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            user_id,
            seq,
            speaker.as_str(),
            content,
            crate::db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update("chat_messages", e))?;
    Ok(seq)
}

/// The newest `limit` messages, oldest first.
fn recent_turns(conn: &Connection, user_id: &str, limit: usize) -> Result<Vec<(i64, ChatTurn, String)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT seq, role, content, created_at
             FROM chat_messages
             WHERE user_id = ?
             ORDER BY seq DESC
             LIMIT ?",
        )
        .map_err(HandlerErr::query)?;
    let mut rows = stmt
        .query_map((user_id, limit as i64), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    rows.reverse();
    Ok(rows
        .into_iter()
        .filter_map(|(seq, role, content, created_at)| {
            Speaker::parse(&role).map(|speaker| (seq, ChatTurn { speaker, content }, created_at))
        })
        .collect())
}

fn chat_send(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
    cfg: &ChatConfig,
) -> Result<serde_json::Value, HandlerErr> {
    let message = get_required_str(params, "message")?;
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(HandlerErr::bad_params(format!(
            "message must be at most {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    // Refuse before logging anything when no credential is configured.
    let client = ChatClient::from_config(cfg)?;

    let user_id = session.user.id.as_str();
    append_message(conn, user_id, Speaker::User, &message)?;
    let history: Vec<ChatTurn> = recent_turns(conn, user_id, cfg.history_window.max(1))?
        .into_iter()
        .map(|(_, turn, _)| turn)
        .collect();
    let preamble = chat::preamble(session.user.role, &session.user.full_name);

    let reply = match client.generate(&preamble, &history) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(code = e.code(), error = %e, "chat request failed");
            return Err(e.into());
        }
    };
    let seq = append_message(conn, user_id, Speaker::Assistant, &reply)?;
    Ok(json!({ "reply": reply, "seq": seq }))
}

fn chat_history(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let limit = params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(100);
    let messages: Vec<serde_json::Value> = recent_turns(conn, &session.user.id, limit)?
        .into_iter()
        .map(|(seq, turn, created_at)| {
            json!({
                "seq": seq,
                "role": turn.speaker,
                "content": turn.content,
                "createdAt": created_at,
            })
        })
        .collect();
    Ok(json!({ "messages": messages }))
}

fn chat_clear(
    conn: &Connection,
    session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let removed = conn
        .execute(
            "DELETE FROM chat_messages WHERE user_id = ?",
            [&session.user.id],
        )
        .map_err(|e| HandlerErr::update("chat_messages", e))?;
    Ok(json!({ "removed": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "chat.send" => {
            let cfg = state.config.chat.clone();
            Some(gated(state, req, ANY_ROLE, |conn, session, params| {
                chat_send(conn, session, params, &cfg)
            }))
        }
        "chat.history" => Some(gated(state, req, ANY_ROLE, chat_history)),
        "chat.clear" => Some(gated(state, req, ANY_ROLE, chat_clear)),
        _ => None,
    }
}
