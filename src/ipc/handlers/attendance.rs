use crate::auth::Session;
use crate::calc::AttendanceStatus;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    ensure_manages_course, gated, get_optional_str, get_required_str, list_roster, load_course,
    parse_past_date, resolve_student, ANY_ROLE, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, Transaction};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SavedMark {
    status: AttendanceStatus,
    reason: Option<String>,
}

fn saved_for_date(
    conn: &Connection,
    course_id: &str,
    date: &str,
) -> Result<HashMap<String, SavedMark>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, status, reason
             FROM attendance
             WHERE course_id = ? AND date = ?",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map((course_id, date), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    let mut out = HashMap::new();
    for (student_id, status, reason) in rows {
        // Rows with an unknown status are treated as unmarked.
        if let Some(status) = AttendanceStatus::parse(&status) {
            out.insert(student_id, SavedMark { status, reason });
        }
    }
    Ok(out)
}

fn upsert_mark(
    tx: &Transaction<'_>,
    student_id: &str,
    course_id: &str,
    date: &str,
    mark: &SavedMark,
    marked_by: &str,
) -> Result<(), HandlerErr> {
    tx.execute(
        "INSERT INTO attendance(id, student_id, course_id, date, status, reason, marked_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id, date) DO UPDATE SET
           status = excluded.status,
           reason = excluded.reason,
           marked_by = excluded.marked_by,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            course_id,
            date,
            mark.status.as_str(),
            &mark.reason,
            marked_by,
            crate::db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update("attendance", e))?;
    Ok(())
}

fn attendance_roster(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = parse_past_date(&get_required_str(params, "date")?)?.to_string();
    let course = load_course(conn, &course_id)?;
    ensure_manages_course(session, &course)?;

    let roster = list_roster(conn, &course_id)?;
    let saved = saved_for_date(conn, &course_id, &date)?;
    let rows: Vec<serde_json::Value> = roster
        .iter()
        .map(|s| {
            let mark = saved.get(&s.id);
            json!({
                "studentId": s.id,
                "fullName": s.full_name,
                "email": s.email,
                "status": mark.map(|m| m.status),
                "reason": mark.and_then(|m| m.reason.clone()),
            })
        })
        .collect();
    let unmarked = rows.iter().filter(|r| r["status"].is_null()).count();
    Ok(json!({
        "courseId": course.id,
        "courseCode": course.code,
        "date": date,
        "rows": rows,
        "unmarkedCount": unmarked,
    }))
}

fn parse_entries(
    params: &serde_json::Value,
) -> Result<HashMap<String, Option<SavedMark>>, HandlerErr> {
    let Some(items) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let mut out = HashMap::new();
    for item in items {
        let student_id = get_required_str(item, "studentId")?;
        let status = match item.get("status") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => {
                let raw = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("status must be string or null"))?;
                Some(AttendanceStatus::parse(raw).ok_or_else(|| {
                    HandlerErr::bad_params(format!("unknown attendance status: {}", raw))
                })?)
            }
        };
        let reason = get_optional_str(item, "reason");
        if out
            .insert(
                student_id.clone(),
                status.map(|status| SavedMark { status, reason }),
            )
            .is_some()
        {
            return Err(HandlerErr::bad_params(format!(
                "duplicate entry for student {}",
                student_id
            )));
        }
    }
    Ok(out)
}

/// All-or-nothing: every roster member needs a status before anything is written.
fn attendance_save(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = parse_past_date(&get_required_str(params, "date")?)?.to_string();
    let course = load_course(conn, &course_id)?;
    ensure_manages_course(session, &course)?;

    let entries = parse_entries(params)?;
    let roster = list_roster(conn, &course_id)?;
    let roster_ids: HashSet<&str> = roster.iter().map(|s| s.id.as_str()).collect();

    let mut strangers: Vec<&str> = entries
        .keys()
        .map(|k| k.as_str())
        .filter(|id| !roster_ids.contains(id))
        .collect();
    if !strangers.is_empty() {
        strangers.sort_unstable();
        return Err(HandlerErr::new(
            "not_enrolled",
            format!("{} student(s) are not enrolled in {}", strangers.len(), course.code),
        )
        .with_details(json!({ "studentIds": strangers })));
    }

    let unmarked: Vec<&str> = roster
        .iter()
        .filter(|s| !matches!(entries.get(&s.id), Some(Some(_))))
        .map(|s| s.id.as_str())
        .collect();
    if !unmarked.is_empty() {
        return Err(HandlerErr::new(
            "unmarked_students",
            format!("{} student(s) have no attendance status", unmarked.len()),
        )
        .with_details(json!({ "count": unmarked.len(), "studentIds": unmarked })));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    for student in &roster {
        if let Some(Some(mark)) = entries.get(&student.id) {
            upsert_mark(&tx, &student.id, &course_id, &date, mark, &session.user.id)?;
        }
    }
    tx.commit().map_err(HandlerErr::commit)?;
    tracing::info!(course = %course.code, date = %date, saved = roster.len(), "attendance saved");
    Ok(json!({ "saved": roster.len(), "date": date }))
}

fn attendance_mark_all(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let date = parse_past_date(&get_required_str(params, "date")?)?.to_string();
    let raw_status = get_required_str(params, "status")?;
    let status = AttendanceStatus::parse(&raw_status).ok_or_else(|| {
        HandlerErr::bad_params(format!("unknown attendance status: {}", raw_status))
    })?;
    let course = load_course(conn, &course_id)?;
    ensure_manages_course(session, &course)?;

    let roster = list_roster(conn, &course_id)?;
    let mark = SavedMark {
        status,
        reason: None,
    };
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    for student in &roster {
        upsert_mark(&tx, &student.id, &course_id, &date, &mark, &session.user.id)?;
    }
    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "saved": roster.len(), "status": status }))
}

fn attendance_history(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = resolve_student(conn, session, params)?;
    let course_filter = get_optional_str(params, "courseId");
    let mut stmt = conn
        .prepare(
            "SELECT a.course_id, c.code, a.date, a.status, a.reason
             FROM attendance a
             JOIN courses c ON c.id = a.course_id
             WHERE a.student_id = ?1 AND (?2 IS NULL OR a.course_id = ?2)
             ORDER BY a.date DESC, c.code",
        )
        .map_err(HandlerErr::query)?;
    let records = stmt
        .query_map((&student_id, &course_filter), |r| {
            Ok(json!({
                "courseId": r.get::<_, String>(0)?,
                "courseCode": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "reason": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "studentId": student_id, "records": records }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.roster" => Some(gated(state, req, STAFF, attendance_roster)),
        "attendance.save" => Some(gated(state, req, STAFF, attendance_save)),
        "attendance.markAll" => Some(gated(state, req, STAFF, attendance_mark_all)),
        "attendance.history" => Some(gated(state, req, ANY_ROLE, attendance_history)),
        _ => None,
    }
}
