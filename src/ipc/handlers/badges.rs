use crate::auth::Session;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::reports::{list_badges, load_course_results, load_summaries, SummaryFilter};
use crate::ipc::helpers::{
    gated, get_optional_str, get_required_str, resolve_student, ANY_ROLE, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const PERFECT_ATTENDANCE: &str = "Perfect Attendance";
pub const TOP_SCORER: &str = "Top Scorer";

fn has_badge(conn: &Connection, student_id: &str, name: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM badges WHERE student_id = ? AND name = ?",
        (student_id, name),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn insert_badge(
    conn: &Connection,
    student_id: &str,
    name: &str,
    description: &str,
    awarded_by: &str,
) -> Result<String, HandlerErr> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO badges(id, student_id, name, description, awarded_by, awarded_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, student_id, name, description, awarded_by, crate::db::now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update("badges", e))?;
    Ok(id)
}

fn badges_award(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = resolve_student(conn, session, params)?;
    let name = get_required_str(params, "name")?;
    let description = get_optional_str(params, "description").unwrap_or_default();
    if has_badge(conn, &student_id, &name)? {
        return Err(HandlerErr::new(
            "already_awarded",
            format!("student already holds {}", name),
        ));
    }
    let id = insert_badge(conn, &student_id, &name, &description, &session.user.id)?;
    tracing::info!(student_id = %student_id, badge = %name, "badge awarded");
    Ok(json!({ "badgeId": id, "studentId": student_id, "name": name }))
}

fn badges_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = resolve_student(conn, session, params)?;
    Ok(json!({ "studentId": student_id, "badges": list_badges(conn, &student_id)? }))
}

/// Awards the rule-based badges the student qualifies for but does not hold.
fn badges_evaluate(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = resolve_student(conn, session, params)?;

    let summaries = load_summaries(
        conn,
        &SummaryFilter {
            student_id: Some(student_id.clone()),
            ..Default::default()
        },
    )?;
    let perfect_attendance = !summaries.is_empty()
        && summaries
            .iter()
            .all(|s| s.counts.total > 0 && s.counts.present == s.counts.total);

    let results = load_course_results(conn, &student_id)?;
    let top_scorer = results.iter().any(|r| r.grade.as_deref() == Some("O"));

    let mut awarded = Vec::new();
    for (qualifies, name, description) in [
        (
            perfect_attendance,
            PERFECT_ATTENDANCE,
            "Present for every recorded class",
        ),
        (top_scorer, TOP_SCORER, "Earned an O grade in a course"),
    ] {
        if qualifies && !has_badge(conn, &student_id, name)? {
            insert_badge(conn, &student_id, name, description, &session.user.id)?;
            awarded.push(name);
        }
    }
    Ok(json!({ "studentId": student_id, "awarded": awarded }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "badges.award" => Some(gated(state, req, STAFF, badges_award)),
        "badges.list" => Some(gated(state, req, ANY_ROLE, badges_list)),
        "badges.evaluate" => Some(gated(state, req, STAFF, badges_evaluate)),
        _ => None,
    }
}
