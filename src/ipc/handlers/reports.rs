use crate::auth::Session;
use crate::calc::{self, AttendanceCounts, RiskLevel};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    ensure_manages_course, gated, get_optional_str, get_required_str, list_roster, load_course,
    resolve_student, ANY_ROLE, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub(super) struct SummaryRow {
    pub student_id: String,
    pub course_id: String,
    pub semester: String,
    pub counts: AttendanceCounts,
}

#[derive(Debug, Clone, Default)]
pub(super) struct SummaryFilter {
    pub student_id: Option<String>,
    pub course_id: Option<String>,
    pub semester: Option<String>,
}

pub(super) fn load_summaries(
    conn: &Connection,
    filter: &SummaryFilter,
) -> Result<Vec<SummaryRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, course_id, semester, present, absent, late, excused, total
             FROM attendance_summary
             WHERE (?1 IS NULL OR student_id = ?1)
               AND (?2 IS NULL OR course_id = ?2)
               AND (?3 IS NULL OR semester = ?3)
             ORDER BY semester, course_id, student_id",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map(
        (&filter.student_id, &filter.course_id, &filter.semester),
        |r| {
            Ok(SummaryRow {
                student_id: r.get(0)?,
                course_id: r.get(1)?,
                semester: r.get(2)?,
                counts: AttendanceCounts {
                    present: r.get(3)?,
                    absent: r.get(4)?,
                    late: r.get(5)?,
                    excused: r.get(6)?,
                    total: r.get(7)?,
                },
            })
        },
    )
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn summary_json(row: &SummaryRow) -> serde_json::Value {
    json!({
        "studentId": row.student_id,
        "courseId": row.course_id,
        "semester": row.semester,
        "present": row.counts.present,
        "absent": row.counts.absent,
        "late": row.counts.late,
        "excused": row.counts.excused,
        "total": row.counts.total,
        "attendancePercentage": row.counts.percentage(),
    })
}

#[derive(Debug, Clone)]
pub(super) struct CourseResult {
    pub course_id: String,
    pub code: String,
    pub name: String,
    pub semester: String,
    pub credits: f64,
    pub internal: Option<f64>,
    pub external: Option<f64>,
    pub series_1: Option<f64>,
    pub series_2: Option<f64>,
    pub assignment: Option<f64>,
    pub predicted_score: Option<i64>,
    pub grade: Option<String>,
    pub grade_point: Option<f64>,
}

/// Every course the student is enrolled in, with marks where entered.
pub(super) fn load_course_results(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<CourseResult>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.code, c.name, c.semester, c.credits,
                    m.internal, m.external, m.series_1, m.series_2, m.assignment,
                    m.predicted_score, m.grade, m.grade_point
             FROM enrollments e
             JOIN courses c ON c.id = e.course_id
             LEFT JOIN marks m ON m.course_id = c.id AND m.student_id = e.student_id
             WHERE e.student_id = ?
             ORDER BY c.semester, c.code",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map([student_id], |r| {
        Ok(CourseResult {
            course_id: r.get(0)?,
            code: r.get(1)?,
            name: r.get(2)?,
            semester: r.get(3)?,
            credits: r.get(4)?,
            internal: r.get(5)?,
            external: r.get(6)?,
            series_1: r.get(7)?,
            series_2: r.get(8)?,
            assignment: r.get(9)?,
            predicted_score: r.get(10)?,
            grade: r.get(11)?,
            grade_point: r.get(12)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

pub(super) fn list_badges(conn: &Connection, student_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, description, awarded_by, awarded_at
             FROM badges
             WHERE student_id = ?
             ORDER BY awarded_at, name",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map([student_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "description": r.get::<_, String>(2)?,
            "awardedBy": r.get::<_, Option<String>>(3)?,
            "awardedAt": r.get::<_, String>(4)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn reports_attendance_summary(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_optional_str(params, "courseId");
    let semester = get_optional_str(params, "semester");

    // Staff may ask for a whole course; otherwise the report is per student.
    let student_id = match (&course_id, get_optional_str(params, "studentId")) {
        (Some(cid), None) if session.user.role != crate::auth::Role::Student => {
            let course = load_course(conn, cid)?;
            ensure_manages_course(session, &course)?;
            None
        }
        _ => Some(resolve_student(conn, session, params)?),
    };

    let rows = load_summaries(
        conn,
        &SummaryFilter {
            student_id: student_id.clone(),
            course_id,
            semester,
        },
    )?;
    let summaries: Vec<serde_json::Value> = rows.iter().map(summary_json).collect();
    Ok(json!({ "studentId": student_id, "summaries": summaries }))
}

fn reports_student_dashboard(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = resolve_student(conn, session, params)?;
    let results = load_course_results(conn, &student_id)?;
    let summaries: HashMap<String, AttendanceCounts> = load_summaries(
        conn,
        &SummaryFilter {
            student_id: Some(student_id.clone()),
            ..Default::default()
        },
    )?
    .into_iter()
    .map(|row| (row.course_id, row.counts))
    .collect();

    let mut by_semester: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    let mut overall = AttendanceCounts::default();
    let mut courses = Vec::with_capacity(results.len());
    for result in &results {
        let counts = summaries.get(&result.course_id).copied().unwrap_or_default();
        overall.merge(&counts);
        let pct = counts.percentage();
        let risk = calc::risk_level(result.internal, counts.ratio_pct());
        if let Some(point) = result.grade_point {
            by_semester
                .entry(result.semester.clone())
                .or_default()
                .push((result.credits, point));
        }
        courses.push(json!({
            "courseId": result.course_id,
            "code": result.code,
            "name": result.name,
            "semester": result.semester,
            "credits": result.credits,
            "marks": {
                "internal": result.internal,
                "external": result.external,
                "series1": result.series_1,
                "series2": result.series_2,
                "assignment": result.assignment,
            },
            "predictedScore": result.predicted_score,
            "grade": result.grade,
            "gradePoint": result.grade_point,
            "attendance": counts,
            "attendancePercentage": pct,
            "risk": risk,
        }));
    }
    let sgpa: Vec<serde_json::Value> = by_semester
        .into_iter()
        .map(|(semester, points)| json!({ "semester": semester, "sgpa": calc::sgpa(points) }))
        .collect();

    Ok(json!({
        "studentId": student_id,
        "courses": courses,
        "sgpa": sgpa,
        "attendance": overall,
        "attendancePercentage": overall.percentage(),
        "badges": list_badges(conn, &student_id)?,
    }))
}

#[derive(Debug, Clone)]
struct MarkRow {
    internal: Option<f64>,
    external: Option<f64>,
    series_1: Option<f64>,
    series_2: Option<f64>,
    assignment: Option<f64>,
    predicted_score: Option<i64>,
    grade: Option<String>,
}

fn load_course_marks(conn: &Connection, course_id: &str) -> Result<HashMap<String, MarkRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, internal, external, series_1, series_2, assignment,
                    predicted_score, grade
             FROM marks
             WHERE course_id = ?",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                MarkRow {
                    internal: r.get(1)?,
                    external: r.get(2)?,
                    series_1: r.get(3)?,
                    series_2: r.get(4)?,
                    assignment: r.get(5)?,
                    predicted_score: r.get(6)?,
                    grade: r.get(7)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(rows.into_iter().collect())
}

fn reports_course_overview(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let course = load_course(conn, &course_id)?;
    ensure_manages_course(session, &course)?;

    let roster = list_roster(conn, &course_id)?;
    let summaries: HashMap<String, AttendanceCounts> = load_summaries(
        conn,
        &SummaryFilter {
            course_id: Some(course_id.clone()),
            ..Default::default()
        },
    )?
    .into_iter()
    .map(|row| (row.student_id, row.counts))
    .collect();

    let mut fields: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();
    let mut grades: BTreeMap<String, i64> = BTreeMap::new();
    let mut risk_counts: BTreeMap<&'static str, i64> = BTreeMap::new();
    let mut at_risk = Vec::new();
    let marks = load_course_marks(conn, &course_id)?;
    for student in &roster {
        let result = marks.get(&student.id);
        if let Some(result) = result {
            for (name, value) in [
                ("internal", result.internal),
                ("external", result.external),
                ("series1", result.series_1),
                ("series2", result.series_2),
                ("assignment", result.assignment),
                ("predictedScore", result.predicted_score.map(|p| p as f64)),
            ] {
                if let Some(v) = value {
                    fields.entry(name).or_default().push(v);
                }
            }
            if let Some(grade) = &result.grade {
                *grades.entry(grade.clone()).or_default() += 1;
            }
        }
        // Students without marks are still rated on attendance.
        let internal = result.and_then(|r| r.internal);
        let counts = summaries.get(&student.id);
        let risk = calc::risk_level(internal, counts.and_then(|c| c.ratio_pct()));
        let key = match risk {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        *risk_counts.entry(key).or_default() += 1;
        if risk == RiskLevel::High {
            at_risk.push(json!({
                "studentId": student.id,
                "fullName": student.full_name,
                "internal": internal,
                "attendancePercentage": counts.and_then(|c| c.percentage()),
            }));
        }
    }
    let averages: serde_json::Map<String, serde_json::Value> = fields
        .into_iter()
        .map(|(name, values)| {
            let avg = calc::mean(values).map(|m| (m * 100.0).round() / 100.0);
            (name.to_string(), json!(avg))
        })
        .collect();

    Ok(json!({
        "courseId": course.id,
        "code": course.code,
        "name": course.name,
        "semester": course.semester,
        "credits": course.credits,
        "studentCount": roster.len(),
        "averages": averages,
        "gradeDistribution": grades,
        "riskCounts": risk_counts,
        "atRisk": at_risk,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.attendanceSummary" => Some(gated(state, req, ANY_ROLE, reports_attendance_summary)),
        "reports.studentDashboard" => Some(gated(state, req, ANY_ROLE, reports_student_dashboard)),
        "reports.courseOverview" => Some(gated(state, req, STAFF, reports_course_overview)),
        _ => None,
    }
}
