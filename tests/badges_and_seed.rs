mod common;

use common::Sidecar;
use serde_json::json;

fn seeded() -> (tempfile::TempDir, Sidecar, serde_json::Value) {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sidecar = Sidecar::spawn();
    sidecar.open_workspace(workspace.path());
    sidecar.bootstrap_admin();
    let seed = sidecar.call_ok("admin.seedSampleData", json!({}));
    (workspace, sidecar, seed)
}

#[test]
fn seeding_is_deterministic_and_runs_once() {
    let (_workspace, mut sidecar, seed) = seeded();
    let students = seed["students"].as_array().expect("students");
    assert_eq!(students.len(), 5);
    assert_eq!(students[0]["email"], json!("student1@sample.school"));

    sidecar.call_err("admin.seedSampleData", json!({}), "already_seeded");

    let overview = sidecar.call_ok(
        "reports.courseOverview",
        json!({ "courseId": seed["courseId"] }),
    );
    assert_eq!(overview["code"], json!("CS301"));
    assert_eq!(overview["studentCount"], json!(5));

    // The sample teacher can sign in and sees the seeded course.
    sidecar.call_ok("auth.logout", json!({}));
    sidecar.login(
        seed["teacher"]["email"].as_str().expect("teacher email"),
        seed["password"].as_str().expect("password"),
    );
    let courses = sidecar.call_ok("courses.list", json!({}));
    assert_eq!(courses["courses"].as_array().map(|c| c.len()), Some(1));
    sidecar.call_err("admin.seedSampleData", json!({}), "forbidden");
}

#[test]
fn evaluate_awards_rule_badges_once() {
    let (_workspace, mut sidecar, seed) = seeded();
    let star = seed["students"][0]["id"].as_str().expect("id").to_string();
    let steady = seed["students"][1]["id"].as_str().expect("id").to_string();

    let first = sidecar.call_ok("badges.evaluate", json!({ "studentId": star }));
    assert_eq!(first["awarded"], json!(["Perfect Attendance", "Top Scorer"]));
    let second = sidecar.call_ok("badges.evaluate", json!({ "studentId": star }));
    assert_eq!(second["awarded"], json!([]));

    let none = sidecar.call_ok("badges.evaluate", json!({ "studentId": steady }));
    assert_eq!(none["awarded"], json!([]));

    sidecar.call_ok(
        "badges.award",
        json!({ "studentId": steady, "name": "Team Player", "description": "Led the lab group" }),
    );
    sidecar.call_err(
        "badges.award",
        json!({ "studentId": steady, "name": "Team Player" }),
        "already_awarded",
    );

    let listed = sidecar.call_ok("badges.list", json!({ "studentId": star }));
    let names: Vec<&str> = listed["badges"]
        .as_array()
        .expect("badges")
        .iter()
        .filter_map(|b| b["name"].as_str())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"Perfect Attendance"));
    assert!(names.contains(&"Top Scorer"));

    // Students read their own badges but cannot award any.
    sidecar.call_ok("auth.logout", json!({}));
    sidecar.login("student2@sample.school", seed["password"].as_str().expect("password"));
    let own = sidecar.call_ok("badges.list", json!({}));
    assert_eq!(own["badges"][0]["name"], json!("Team Player"));
    sidecar.call_err(
        "badges.award",
        json!({ "studentId": steady, "name": "Self Made" }),
        "forbidden",
    );
    let dashboard = sidecar.call_ok("reports.studentDashboard", json!({}));
    assert_eq!(dashboard["badges"].as_array().map(|b| b.len()), Some(1));
}
