mod common;

use common::{days_ago, Sidecar};
use serde_json::json;

struct Fixture {
    _workspace: tempfile::TempDir,
    sidecar: Sidecar,
    course_id: String,
    students: Vec<String>,
}

/// Admin-created course of three students taught by teacher@school.test,
/// with the teacher signed in.
fn fixture() -> Fixture {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sidecar = Sidecar::spawn();
    sidecar.open_workspace(workspace.path());
    sidecar.bootstrap_admin();
    let teacher_id = sidecar.create_user("teacher@school.test", "teacher", "Tess Teacher");
    let students: Vec<String> = ["Ann", "Bob", "Cat"]
        .iter()
        .map(|name| {
            sidecar.create_user(
                &format!("{}@school.test", name.to_ascii_lowercase()),
                "student",
                name,
            )
        })
        .collect();
    let course_id = sidecar.create_course("CS210", "S3", &teacher_id);
    let ids: Vec<&str> = students.iter().map(|s| s.as_str()).collect();
    sidecar.enroll(&course_id, &ids);
    sidecar.call_ok("auth.logout", json!({}));
    sidecar.login("teacher@school.test", "password-123");
    Fixture {
        _workspace: workspace,
        sidecar,
        course_id,
        students,
    }
}

#[test]
fn save_is_rejected_while_any_student_is_unmarked() {
    let Fixture {
        _workspace,
        mut sidecar,
        course_id,
        students,
    } = fixture();
    let date = days_ago(1);

    let roster = sidecar.call_ok("attendance.roster", json!({ "courseId": course_id, "date": date }));
    assert_eq!(roster["unmarkedCount"], json!(3));

    let error = sidecar.call_err(
        "attendance.save",
        json!({
            "courseId": course_id,
            "date": date,
            "entries": [
                { "studentId": students[0], "status": "present" },
                { "studentId": students[1], "status": null },
            ],
        }),
        "unmarked_students",
    );
    assert_eq!(error["details"]["count"], json!(2));

    // Nothing was written by the rejected save.
    let roster = sidecar.call_ok("attendance.roster", json!({ "courseId": course_id, "date": date }));
    assert_eq!(roster["unmarkedCount"], json!(3));

    let saved = sidecar.call_ok(
        "attendance.save",
        json!({
            "courseId": course_id,
            "date": date,
            "entries": [
                { "studentId": students[0], "status": "present" },
                { "studentId": students[1], "status": "absent", "reason": "sick" },
                { "studentId": students[2], "status": "late" },
            ],
        }),
    );
    assert_eq!(saved["saved"], json!(3));

    let roster = sidecar.call_ok("attendance.roster", json!({ "courseId": course_id, "date": date }));
    assert_eq!(roster["unmarkedCount"], json!(0));
    let bob = roster["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .find(|r| r["studentId"] == json!(students[1]))
        .cloned()
        .expect("bob row");
    assert_eq!(bob["status"], json!("absent"));
    assert_eq!(bob["reason"], json!("sick"));
}

#[test]
fn resaving_a_date_overwrites_instead_of_duplicating() {
    let Fixture {
        _workspace,
        mut sidecar,
        course_id,
        students,
    } = fixture();
    let date = days_ago(3);

    sidecar.call_ok(
        "attendance.markAll",
        json!({ "courseId": course_id, "date": date, "status": "present" }),
    );
    sidecar.call_ok(
        "attendance.markAll",
        json!({ "courseId": course_id, "date": date, "status": "Absent" }),
    );
    let summary = sidecar.call_ok(
        "reports.attendanceSummary",
        json!({ "courseId": course_id, "studentId": students[0] }),
    );
    let rows = summary["summaries"].as_array().expect("summaries");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["total"], json!(1));
    assert_eq!(rows[0]["absent"], json!(1));
    assert_eq!(rows[0]["attendancePercentage"], json!(0));
}

#[test]
fn strangers_future_dates_and_bad_statuses_are_rejected() {
    let Fixture {
        _workspace,
        mut sidecar,
        course_id,
        students,
    } = fixture();

    sidecar.call_err(
        "attendance.markAll",
        json!({ "courseId": course_id, "date": days_ago(-2), "status": "present" }),
        "bad_params",
    );
    sidecar.call_err(
        "attendance.markAll",
        json!({ "courseId": course_id, "date": days_ago(1), "status": "tardy" }),
        "bad_params",
    );

    let mut entries: Vec<serde_json::Value> = students
        .iter()
        .map(|id| json!({ "studentId": id, "status": "present" }))
        .collect();
    entries.push(json!({ "studentId": "not-a-student", "status": "present" }));
    let error = sidecar.call_err(
        "attendance.save",
        json!({ "courseId": course_id, "date": days_ago(1), "entries": entries }),
        "not_enrolled",
    );
    assert_eq!(error["details"]["studentIds"], json!(["not-a-student"]));
}

#[test]
fn students_see_only_their_own_history() {
    let Fixture {
        _workspace,
        mut sidecar,
        course_id,
        students,
    } = fixture();
    sidecar.call_ok(
        "attendance.markAll",
        json!({ "courseId": course_id, "date": days_ago(1), "status": "present" }),
    );
    sidecar.call_ok("auth.logout", json!({}));
    sidecar.login("ann@school.test", "password-123");

    let mine = sidecar.call_ok("attendance.history", json!({}));
    assert_eq!(mine["studentId"], json!(students[0]));
    assert_eq!(mine["records"].as_array().map(|r| r.len()), Some(1));

    sidecar.call_err(
        "attendance.history",
        json!({ "studentId": students[1] }),
        "forbidden",
    );
    sidecar.call_err(
        "attendance.roster",
        json!({ "courseId": course_id, "date": days_ago(1) }),
        "forbidden",
    );
}
