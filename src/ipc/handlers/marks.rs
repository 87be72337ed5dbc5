use crate::auth::{Role, Session};
use crate::calc::{self, AssessmentScores};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    ensure_manages_course, gated, get_optional_f64, get_optional_str, get_required_str,
    is_enrolled, load_course, resolve_student, ANY_ROLE, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct MarkInputs {
    pub internal: Option<f64>,
    pub external: Option<f64>,
    pub series_1: Option<f64>,
    pub series_2: Option<f64>,
    pub assignment: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Derived {
    pub predicted_score: Option<i64>,
    pub grade: Option<&'static str>,
    pub grade_point: Option<f64>,
}

pub(super) fn derive(inputs: &MarkInputs) -> Derived {
    let predicted_score = calc::predicted_score(&AssessmentScores {
        internal: inputs.internal,
        series_1: inputs.series_1,
        series_2: inputs.series_2,
        assignment: inputs.assignment,
    });
    let graded = calc::grading_basis(inputs.external, predicted_score).map(calc::calculate_grade_point);
    Derived {
        predicted_score,
        grade: graded.map(|g| g.grade),
        grade_point: graded.map(|g| g.point),
    }
}

fn load_marks(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<Option<MarkInputs>, HandlerErr> {
    conn.query_row(
        "SELECT internal, external, series_1, series_2, assignment
         FROM marks
         WHERE student_id = ? AND course_id = ?",
        (student_id, course_id),
        |r| {
            Ok(MarkInputs {
                internal: r.get(0)?,
                external: r.get(1)?,
                series_1: r.get(2)?,
                series_2: r.get(3)?,
                assignment: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

pub(super) fn write_marks(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    inputs: &MarkInputs,
) -> Result<Derived, HandlerErr> {
    let derived = derive(inputs);
    conn.execute(
        "INSERT INTO marks(id, student_id, course_id, internal, external, series_1, series_2,
                           assignment, predicted_score, grade, grade_point, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id) DO UPDATE SET
           internal = excluded.internal,
           external = excluded.external,
           series_1 = excluded.series_1,
           series_2 = excluded.series_2,
           assignment = excluded.assignment,
           predicted_score = excluded.predicted_score,
           grade = excluded.grade,
           grade_point = excluded.grade_point,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            course_id,
            inputs.internal,
            inputs.external,
            inputs.series_1,
            inputs.series_2,
            inputs.assignment,
            derived.predicted_score,
            derived.grade,
            derived.grade_point,
            crate::db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update("marks", e))?;
    Ok(derived)
}

fn marks_upsert(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let course = load_course(conn, &course_id)?;
    ensure_manages_course(session, &course)?;
    if !is_enrolled(conn, &course_id, &student_id)? {
        return Err(HandlerErr::new(
            "not_enrolled",
            format!("student is not enrolled in {}", course.code),
        ));
    }

    // A missing key keeps the stored score; an explicit null clears it.
    let mut inputs = load_marks(conn, &student_id, &course_id)?.unwrap_or_default();
    for (key, slot) in [
        ("internal", &mut inputs.internal),
        ("external", &mut inputs.external),
        ("series1", &mut inputs.series_1),
        ("series2", &mut inputs.series_2),
        ("assignment", &mut inputs.assignment),
    ] {
        if params.get(key).is_some() {
            let value = get_optional_f64(params, key)?;
            *slot = calc::validate_score(key, value).map_err(HandlerErr::bad_params)?;
        }
    }
    let derived = write_marks(conn, &student_id, &course_id, &inputs)?;
    tracing::debug!(course = %course.code, student_id = %student_id, "marks saved");
    Ok(json!({
        "studentId": student_id,
        "courseId": course_id,
        "marks": {
            "internal": inputs.internal,
            "external": inputs.external,
            "series1": inputs.series_1,
            "series2": inputs.series_2,
            "assignment": inputs.assignment,
        },
        "predictedScore": derived.predicted_score,
        "grade": derived.grade,
        "gradePoint": derived.grade_point,
    }))
}

fn marks_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_filter = get_optional_str(params, "courseId");
    let (filter, args): (String, Vec<String>) = match (session.user.role, course_filter) {
        (Role::Student, course) => {
            let student_id = resolve_student(conn, session, params)?;
            match course {
                Some(c) => (
                    "m.student_id = ? AND m.course_id = ?".into(),
                    vec![student_id, c],
                ),
                None => ("m.student_id = ?".into(), vec![student_id]),
            }
        }
        (_, Some(course_id)) => {
            let course = load_course(conn, &course_id)?;
            ensure_manages_course(session, &course)?;
            ("m.course_id = ?".into(), vec![course_id])
        }
        (_, None) => {
            let student_id = resolve_student(conn, session, params)?;
            if session.user.role == Role::Teacher {
                (
                    "m.student_id = ? AND c.teacher_id = ?".into(),
                    vec![student_id, session.user.id.clone()],
                )
            } else {
                ("m.student_id = ?".into(), vec![student_id])
            }
        }
    };
    let sql = format!(
        "SELECT m.student_id, u.full_name, m.course_id, c.code, c.semester,
                m.internal, m.external, m.series_1, m.series_2, m.assignment,
                m.predicted_score, m.grade, m.grade_point, m.updated_at
         FROM marks m
         JOIN users u ON u.id = m.student_id
         JOIN courses c ON c.id = m.course_id
         WHERE {}
         ORDER BY c.semester, c.code, u.full_name",
        filter
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let marks = stmt
        .query_map(params_from_iter(args), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "courseId": r.get::<_, String>(2)?,
                "courseCode": r.get::<_, String>(3)?,
                "semester": r.get::<_, String>(4)?,
                "internal": r.get::<_, Option<f64>>(5)?,
                "external": r.get::<_, Option<f64>>(6)?,
                "series1": r.get::<_, Option<f64>>(7)?,
                "series2": r.get::<_, Option<f64>>(8)?,
                "assignment": r.get::<_, Option<f64>>(9)?,
                "predictedScore": r.get::<_, Option<i64>>(10)?,
                "grade": r.get::<_, Option<String>>(11)?,
                "gradePoint": r.get::<_, Option<f64>>(12)?,
                "updatedAt": r.get::<_, String>(13)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "marks": marks }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.upsert" => Some(gated(state, req, STAFF, marks_upsert)),
        "marks.list" => Some(gated(state, req, ANY_ROLE, marks_list)),
        _ => None,
    }
}
