mod common;

use common::{days_ago, Sidecar};
use serde_json::json;

fn assert_routed(value: &serde_json::Value, method: &str) {
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(code, "not_implemented", "unexpected unknown method for {}", method);
    }
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let bundle_out = workspace.path().join("smoke-backup.zip");
    let mut sidecar = Sidecar::spawn();

    let health = sidecar.call_ok("health", json!({}));
    assert_eq!(health["signedIn"], json!(false));
    assert!(health["workspacePath"].is_null());

    let opened = sidecar.open_workspace(workspace.path());
    assert_eq!(opened["needsBootstrap"], json!(true));
    sidecar.bootstrap_admin();

    let teacher_id = sidecar.create_user("teacher@school.test", "teacher", "Tess Teacher");
    let student_id = sidecar.create_user("student@school.test", "student", "Stu Dent");
    let course_id = sidecar.create_course("CS101", "S1", &teacher_id);
    sidecar.enroll(&course_id, &[&student_id]);
    let date = days_ago(1);

    let calls = [
        ("auth.whoami", json!({})),
        ("route.check", json!({ "path": "/admin" })),
        ("users.list", json!({})),
        ("courses.list", json!({})),
        ("attendance.roster", json!({ "courseId": course_id, "date": date })),
        (
            "attendance.save",
            json!({
                "courseId": course_id,
                "date": date,
                "entries": [{ "studentId": student_id, "status": "present" }],
            }),
        ),
        (
            "attendance.markAll",
            json!({ "courseId": course_id, "date": days_ago(2), "status": "late" }),
        ),
        ("attendance.history", json!({ "studentId": student_id })),
        (
            "marks.upsert",
            json!({ "studentId": student_id, "courseId": course_id, "internal": 82 }),
        ),
        ("marks.list", json!({ "studentId": student_id })),
        ("reports.attendanceSummary", json!({ "courseId": course_id })),
        ("reports.studentDashboard", json!({ "studentId": student_id })),
        ("reports.courseOverview", json!({ "courseId": course_id })),
        (
            "badges.award",
            json!({ "studentId": student_id, "name": "Helper", "description": "Helped out" }),
        ),
        ("badges.list", json!({ "studentId": student_id })),
        ("badges.evaluate", json!({ "studentId": student_id })),
        ("chat.history", json!({})),
        ("chat.clear", json!({})),
        ("prefs.get", json!({})),
        ("prefs.setTheme", json!({ "theme": "dark" })),
        ("admin.seedSampleData", json!({})),
        ("backup.export", json!({ "outPath": bundle_out.to_string_lossy() })),
    ];
    for (method, params) in calls {
        let value = sidecar.request(method, params);
        assert_routed(&value, method);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
    }

    // No key configured in this process.
    sidecar.call_err("chat.send", json!({ "message": "hello" }), "chat_unavailable");

    let unknown = sidecar.request("grades.teleport", json!({}));
    assert_eq!(unknown["error"]["code"], json!("not_implemented"));

    let imported = sidecar.call_ok("backup.import", json!({ "inPath": bundle_out.to_string_lossy() }));
    assert_eq!(imported["signedOut"], json!(true));
    sidecar.call_ok("auth.logout", json!({}));
}

#[test]
fn requests_before_workspace_selection_are_refused() {
    let mut sidecar = Sidecar::spawn();
    sidecar.call_err("users.list", json!({}), "no_workspace");
    sidecar.call_err(
        "auth.login",
        json!({ "email": "a@b.c", "password": "whatever-1" }),
        "no_workspace",
    );
    sidecar.call_err("workspace.select", json!({}), "bad_params");
}

#[test]
fn malformed_lines_get_bad_json_without_killing_the_loop() {
    use std::io::{BufRead, BufReader, Write};
    use std::process::{Command, Stdio};

    let mut child = Command::new(env!("CARGO_BIN_EXE_schoold"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let mut stdin = child.stdin.take().expect("stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("stdout"));

    writeln!(stdin, "{{not json").expect("write");
    writeln!(stdin, "{}", json!({ "id": "h", "method": "health" })).expect("write");
    stdin.flush().expect("flush");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let first: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(first["error"]["code"], json!("bad_json"));

    line.clear();
    reader.read_line(&mut line).expect("read");
    let second: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(second["id"], json!("h"));
    assert_eq!(second["ok"], json!(true));

    drop(stdin);
    let _ = child.wait();
}
