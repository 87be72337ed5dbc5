use crate::auth::{self, Role, Session};
use crate::backup;
use crate::calc::AttendanceStatus;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::handlers::marks::{write_marks, MarkInputs};
use crate::ipc::helpers::{deny, gated, ADMIN_ONLY};
use crate::ipc::types::{AppState, Request};
use chrono::Duration;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

const SAMPLE_TEACHER_EMAIL: &str = "teacher@sample.school";
const SAMPLE_PASSWORD: &str = "sample-pass";
const SAMPLE_COURSE_CODE: &str = "CS301";
const SAMPLE_DAYS: i64 = 10;

// (name, internal, series 1, series 2, assignment)
const SAMPLE_STUDENTS: &[(&str, f64, f64, f64, f64)] = &[
    ("Asha Menon", 92.0, 88.0, 95.0, 90.0),
    ("Ben Okafor", 78.0, 74.0, 80.0, 85.0),
    ("Chen Li", 65.0, 60.0, 58.0, 70.0),
    ("Dana Cruz", 84.0, 81.0, 79.0, 88.0),
    ("Eli Novak", 71.0, 69.0, 73.0, 75.0),
];

/// Deterministic status for student `i` on day `d`; student 0 is never absent.
fn sample_status(i: usize, d: i64) -> AttendanceStatus {
    if i == 0 {
        return AttendanceStatus::Present;
    }
    match (i as i64 * 7 + d * 3) % 10 {
        0..=6 => AttendanceStatus::Present,
        7 => AttendanceStatus::Late,
        8 => AttendanceStatus::Absent,
        _ => AttendanceStatus::Excused,
    }
}

fn admin_seed_sample_data(
    conn: &Connection,
    session: &Session,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let seeded = conn
        .query_row(
            "SELECT 1 FROM users WHERE email = ?",
            [SAMPLE_TEACHER_EMAIL],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .is_some();
    if seeded {
        return Err(HandlerErr::new("already_seeded", "sample data already present"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let teacher = auth::create_user(&tx, SAMPLE_TEACHER_EMAIL, SAMPLE_PASSWORD, Role::Teacher, "Sam Teacher")?;

    let course_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO courses(id, code, name, semester, credits, teacher_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&course_id, SAMPLE_COURSE_CODE, "Data Structures", "S5", 4.0, &teacher.id),
    )
    .map_err(|e| HandlerErr::update("courses", e))?;

    let today = chrono::Utc::now().date_naive();
    let mut students = Vec::with_capacity(SAMPLE_STUDENTS.len());
    for (i, (name, internal, s1, s2, assignment)) in SAMPLE_STUDENTS.iter().enumerate() {
        let email = format!("student{}@sample.school", i + 1);
        let student = auth::create_user(&tx, &email, SAMPLE_PASSWORD, Role::Student, name)?;
        tx.execute(
            "INSERT INTO enrollments(course_id, student_id) VALUES(?, ?)",
            (&course_id, &student.id),
        )
        .map_err(|e| HandlerErr::update("enrollments", e))?;

        for d in 1..=SAMPLE_DAYS {
            let date = (today - Duration::days(d)).to_string();
            tx.execute(
                "INSERT INTO attendance(id, student_id, course_id, date, status, reason, marked_by, updated_at)
                 VALUES(?, ?, ?, ?, ?, NULL, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &student.id,
                    &course_id,
                    &date,
                    sample_status(i, d).as_str(),
                    &teacher.id,
                    crate::db::now_rfc3339(),
                ),
            )
            .map_err(|e| HandlerErr::update("attendance", e))?;
        }

        write_marks(
            &tx,
            &student.id,
            &course_id,
            &MarkInputs {
                internal: Some(*internal),
                external: None,
                series_1: Some(*s1),
                series_2: Some(*s2),
                assignment: Some(*assignment),
            },
        )?;
        students.push(json!({ "id": student.id, "email": email, "fullName": name }));
    }
    tx.commit().map_err(HandlerErr::commit)?;
    tracing::info!(seeded_by = %session.user.id, students = students.len(), "sample data seeded");

    Ok(json!({
        "teacher": { "id": teacher.id, "email": teacher.email },
        "courseId": course_id,
        "students": students,
        "password": SAMPLE_PASSWORD,
    }))
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(denied) = deny(state, req, ADMIN_ONLY) {
        return denied;
    }
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(export) => {
            tracing::info!(out = %out.display(), "workspace exported");
            ok(
                &req.id,
                json!({
                    "outPath": out.to_string_lossy(),
                    "bundleFormat": export.bundle_format,
                    "dbSha256": export.db_sha256,
                    "entryCount": export.entry_count,
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "io_failed",
            format!("{e:#}"),
            Some(json!({ "path": out.to_string_lossy() })),
        ),
    }
}

/// Reopens the untouched database after a failed import. Returns the
/// reopen error, if any; the workspace then stays closed.
fn reopen_after_failed_import(state: &mut AppState, workspace_path: PathBuf) -> Option<String> {
    match open_workspace(state, workspace_path) {
        Ok(()) => None,
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!(error = %message, "workspace not reopened after failed import");
            Some(message)
        }
    }
}

/// Replaces the workspace database and signs everyone out.
fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(denied) = deny(state, req, ADMIN_ONLY) {
        return denied;
    }
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let src = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": src.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;
    state.session = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            let mut details = json!({ "path": src.to_string_lossy() });
            if let Some(reopen) = reopen_after_failed_import(state, workspace_path) {
                details["reopenError"] = json!(reopen);
            }
            return err(&req.id, "import_failed", format!("{e:#}"), Some(details));
        }
    };

    match open_workspace(state, workspace_path.clone()) {
        Ok(()) => {
            tracing::info!(src = %src.display(), "workspace imported");
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormat": import.bundle_format,
                    "dbSha256": import.db_sha256,
                    "signedOut": true,
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admin.seedSampleData" => Some(gated(state, req, ADMIN_ONLY, admin_seed_sample_data)),
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_student_has_perfect_attendance() {
        assert!((1..=SAMPLE_DAYS).all(|d| sample_status(0, d) == AttendanceStatus::Present));
        let mixed: Vec<AttendanceStatus> = (1..=SAMPLE_DAYS).map(|d| sample_status(2, d)).collect();
        assert!(mixed.contains(&AttendanceStatus::Absent) || mixed.contains(&AttendanceStatus::Late));
    }

    #[test]
    fn failed_reopen_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = AppState::new();
        assert!(reopen_after_failed_import(&mut state, dir.path().to_path_buf()).is_none());
        assert!(state.db.is_some());

        // A plain file where the workspace directory should be.
        let blocked = dir.path().join("not-a-dir");
        std::fs::write(&blocked, b"x").expect("write file");
        state.db = None;
        let reported = reopen_after_failed_import(&mut state, blocked);
        assert!(reported.is_some_and(|m| !m.is_empty()));
        assert!(state.db.is_none());
    }
}
