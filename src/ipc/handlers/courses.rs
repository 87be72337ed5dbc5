use crate::auth::{Role, Session};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    gated, get_optional_f64, get_optional_str, get_required_str, get_string_array, load_course,
    student_exists, ADMIN_ONLY, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn courses_create(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?.to_ascii_uppercase();
    let name = get_required_str(params, "name")?;
    let semester = get_required_str(params, "semester")?;
    let credits = get_optional_f64(params, "credits")?.unwrap_or(3.0);
    if credits <= 0.0 {
        return Err(HandlerErr::bad_params("credits must be positive"));
    }
    let teacher_id = get_optional_str(params, "teacherId");
    if let Some(tid) = teacher_id.as_deref() {
        let is_teacher = conn
            .query_row(
                "SELECT 1 FROM users WHERE id = ? AND role = 'teacher'",
                [tid],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(HandlerErr::query)?
            .is_some();
        if !is_teacher {
            return Err(HandlerErr::not_found("teacher"));
        }
    }

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, code, name, semester, credits, teacher_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&course_id, &code, &name, &semester, credits, &teacher_id),
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            HandlerErr::new("code_taken", format!("course code {} already exists", code))
        }
        other => HandlerErr::update("courses", other),
    })?;
    Ok(json!({
        "courseId": course_id,
        "code": code,
        "name": name,
        "semester": semester,
        "credits": credits,
        "teacherId": teacher_id,
    }))
}

fn courses_list(
    conn: &Connection,
    session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    const COLUMNS: &str = "SELECT c.id, c.code, c.name, c.semester, c.credits, c.teacher_id,
                (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id)
         FROM courses c";
    let (filter, args): (&str, Vec<&str>) = match session.user.role {
        Role::Admin => ("", Vec::new()),
        Role::Teacher => (" WHERE c.teacher_id = ?", vec![session.user.id.as_str()]),
        Role::Student => (
            " JOIN enrollments me ON me.course_id = c.id AND me.student_id = ?",
            vec![session.user.id.as_str()],
        ),
    };
    let sql = format!("{}{} ORDER BY c.semester, c.code", COLUMNS, filter);
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let courses = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "semester": r.get::<_, String>(3)?,
                "credits": r.get::<_, f64>(4)?,
                "teacherId": r.get::<_, Option<String>>(5)?,
                "studentCount": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "courses": courses }))
}

fn courses_enroll(
    conn: &Connection,
    _session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_ids = get_string_array(params, "studentIds")?;
    load_course(conn, &course_id)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let mut enrolled = 0usize;
    let mut unknown: Vec<String> = Vec::new();
    for student_id in student_ids {
        if !student_exists(&tx, &student_id)? {
            unknown.push(student_id);
            continue;
        }
        enrolled += tx
            .execute(
                "INSERT OR IGNORE INTO enrollments(course_id, student_id) VALUES(?, ?)",
                (&course_id, &student_id),
            )
            .map_err(|e| HandlerErr::update("enrollments", e))?;
    }
    if !unknown.is_empty() {
        // Nothing is committed when any id is wrong.
        return Err(HandlerErr::not_found("student").with_details(json!({ "studentIds": unknown })));
    }
    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "enrolled": enrolled }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(gated(state, req, ADMIN_ONLY, courses_create)),
        "courses.list" => Some(gated(state, req, ANY_ROLE, courses_list)),
        "courses.enroll" => Some(gated(state, req, ADMIN_ONLY, courses_enroll)),
        _ => None,
    }
}
