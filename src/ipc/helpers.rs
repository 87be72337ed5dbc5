use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{self, gate, Access, Role, Session};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

pub const ADMIN_ONLY: &[Role] = &[Role::Admin];
pub const STAFF: &[Role] = &[Role::Admin, Role::Teacher];
pub const ANY_ROLE: &[Role] = Role::ALL;

/// Signs out a session whose TTL has passed. Returns whether one was dropped.
pub fn expire_session(state: &mut AppState) -> bool {
    let expired = state
        .session
        .as_ref()
        .is_some_and(|s| s.expires_at <= chrono::Utc::now());
    if !expired {
        return false;
    }
    if let Some(session) = state.session.take() {
        if let Some(conn) = state.db.as_ref() {
            if let Err(e) = auth::logout(conn, &session.token) {
                tracing::warn!(error = %e, "failed to delete expired session");
            }
        }
        tracing::info!(user_id = %session.user.id, "session expired");
    }
    true
}

/// Error response for a request the current session may not make, if any.
pub fn deny(state: &mut AppState, req: &Request, roles: &[Role]) -> Option<serde_json::Value> {
    if state.db.is_none() {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    }
    if expire_session(state) {
        return Some(err(&req.id, "session_expired", "session expired, sign in again", None));
    }
    match gate(state.session.as_ref(), roles) {
        Access::Granted => None,
        Access::RedirectLogin => Some(err(&req.id, "login_required", "sign in first", None)),
        Access::RedirectUnauthorized => {
            let role = state.session.as_ref().map(|s| s.user.role.as_str());
            Some(err(
                &req.id,
                "forbidden",
                format!("{} is not allowed for this role", req.method),
                Some(json!({ "role": role })),
            ))
        }
    }
}

/// Runs `f` once a workspace is open and the signed-in user holds one of `roles`.
pub fn gated<F>(state: &mut AppState, req: &Request, roles: &[Role], f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &Session, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    if let Some(denied) = deny(state, req, roles) {
        return denied;
    }
    let (Some(conn), Some(session)) = (state.db.as_ref(), state.session.as_ref()) else {
        return err(&req.id, "login_required", "sign in first", None);
    };
    match f(conn, session, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number or null", key))),
    }
}

pub fn get_string_array(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(items) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    Ok(items
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect())
}

/// `YYYY-MM-DD`, not later than today (UTC).
pub fn parse_past_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;
    if date > chrono::Utc::now().date_naive() {
        return Err(HandlerErr::bad_params("date must not be in the future"));
    }
    Ok(date)
}

#[derive(Debug, Clone)]
pub struct CourseRow {
    pub id: String,
    pub code: String,
    pub name: String,
    pub semester: String,
    pub credits: f64,
    pub teacher_id: Option<String>,
}

pub fn load_course(conn: &Connection, course_id: &str) -> Result<CourseRow, HandlerErr> {
    conn.query_row(
        "SELECT id, code, name, semester, credits, teacher_id FROM courses WHERE id = ?",
        [course_id],
        |r| {
            Ok(CourseRow {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                semester: r.get(3)?,
                credits: r.get(4)?,
                teacher_id: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("course"))
}

/// Admins manage every course; teachers only the ones assigned to them.
pub fn ensure_manages_course(session: &Session, course: &CourseRow) -> Result<(), HandlerErr> {
    match session.user.role {
        Role::Admin => Ok(()),
        Role::Teacher if course.teacher_id.as_deref() == Some(session.user.id.as_str()) => Ok(()),
        _ => Err(HandlerErr::new(
            "forbidden",
            format!("not assigned to course {}", course.code),
        )),
    }
}

pub fn is_enrolled(conn: &Connection, course_id: &str, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
        (course_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM users WHERE id = ? AND role = 'student'",
        [student_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

/// Picks the student a read request is about. Students always read
/// themselves; staff must name one.
pub fn resolve_student(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<String, HandlerErr> {
    let requested = get_optional_str(params, "studentId");
    let student_id = match (session.user.role, requested) {
        (Role::Student, None) => return Ok(session.user.id.clone()),
        (Role::Student, Some(id)) if id == session.user.id => return Ok(id),
        (Role::Student, Some(_)) => {
            return Err(HandlerErr::new(
                "forbidden",
                "students may only view their own records",
            ))
        }
        (_, None) => return Err(HandlerErr::bad_params("missing studentId")),
        (_, Some(id)) => id,
    };
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student"));
    }
    if session.user.role == Role::Teacher && !teaches_student(conn, &session.user.id, &student_id)? {
        return Err(HandlerErr::new(
            "forbidden",
            "student is not enrolled in any of your courses",
        ));
    }
    Ok(student_id)
}

pub fn teaches_student(conn: &Connection, teacher_id: &str, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1
         FROM enrollments e
         JOIN courses c ON c.id = e.course_id
         WHERE c.teacher_id = ? AND e.student_id = ?
         LIMIT 1",
        (teacher_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub full_name: String,
    pub email: String,
}

pub fn list_roster(conn: &Connection, course_id: &str) -> Result<Vec<RosterStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.full_name, u.email
             FROM enrollments e
             JOIN users u ON u.id = e.student_id
             WHERE e.course_id = ?
             ORDER BY u.full_name, u.id",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map([course_id], |r| {
        Ok(RosterStudent {
            id: r.get(0)?,
            full_name: r.get(1)?,
            email: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn signed_in_admin(dir: &std::path::Path) -> AppState {
        let conn = crate::db::open_db(dir).expect("open db");
        auth::create_user(&conn, "admin@school.test", "admin-password", Role::Admin, "Ada")
            .expect("admin");
        let session = auth::login(&conn, "admin@school.test", "admin-password", 8).expect("login");
        let mut state = AppState::new();
        state.db = Some(conn);
        state.session = Some(session);
        state
    }

    fn request(method: &str) -> Request {
        Request {
            id: "1".into(),
            method: method.into(),
            params: json!({}),
        }
    }

    #[test]
    fn live_session_is_granted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = signed_in_admin(dir.path());
        assert!(deny(&mut state, &request("users.list"), ADMIN_ONLY).is_none());
        assert!(state.session.is_some());
    }

    #[test]
    fn expired_session_is_signed_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = signed_in_admin(dir.path());
        let token = match state.session.as_mut() {
            Some(session) => {
                session.expires_at = Utc::now() - Duration::hours(5);
                session.token.clone()
            }
            None => panic!("signed in"),
        };

        let denied = deny(&mut state, &request("users.list"), ADMIN_ONLY).expect("denied");
        assert_eq!(denied["error"]["code"], json!("session_expired"));
        assert!(state.session.is_none());

        let conn = state.db.as_ref().expect("db");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions WHERE token = ?", [&token], |r| r.get(0))
            .expect("count");
        assert_eq!(rows, 0);

        let again = deny(&mut state, &request("users.list"), ADMIN_ONLY).expect("denied");
        assert_eq!(again["error"]["code"], json!("login_required"));
    }
}
