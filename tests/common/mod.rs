#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub const ADMIN_EMAIL: &str = "admin@school.test";
pub const ADMIN_PASSWORD: &str = "admin-password";

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        Self::spawn_with_env(&[])
    }

    /// Chat settings always come from the given env, never from the host's.
    pub fn spawn_with_env(env: &[(&str, &str)]) -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut cmd = Command::new(exe);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env_remove("SCHOOLD_CHAT_API_KEY")
            .env_remove("SCHOOLD_CHAT_ENDPOINT")
            .env_remove("SCHOOLD_CHAT_MODEL");
        for (k, v) in env {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn().expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 1,
        }
    }

    /// Raw response envelope.
    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id.to_string();
        self.next_id += 1;
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    /// The `result` of a request that must succeed.
    pub fn call_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or_default()
    }

    /// The `error` object of a request that must fail with `code`.
    pub fn call_err(&mut self, method: &str, params: serde_json::Value, code: &str) -> serde_json::Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        let error = value.get("error").cloned().unwrap_or_default();
        assert_eq!(
            error.get("code").and_then(|v| v.as_str()),
            Some(code),
            "{} returned {}",
            method,
            error
        );
        error
    }

    pub fn open_workspace(&mut self, path: &Path) -> serde_json::Value {
        self.call_ok("workspace.select", json!({ "path": path.to_string_lossy() }))
    }

    pub fn login(&mut self, email: &str, password: &str) -> serde_json::Value {
        self.call_ok("auth.login", json!({ "email": email, "password": password }))
    }

    /// Creates the first admin and signs in as them.
    pub fn bootstrap_admin(&mut self) -> serde_json::Value {
        self.call_ok(
            "auth.bootstrap",
            json!({ "email": ADMIN_EMAIL, "password": ADMIN_PASSWORD, "fullName": "Ada Admin" }),
        );
        self.login(ADMIN_EMAIL, ADMIN_PASSWORD)
    }

    pub fn create_user(&mut self, email: &str, role: &str, full_name: &str) -> String {
        let result = self.call_ok(
            "users.create",
            json!({
                "email": email,
                "password": "password-123",
                "role": role,
                "fullName": full_name,
            }),
        );
        result["user"]["id"].as_str().expect("user id").to_string()
    }

    pub fn create_course(&mut self, code: &str, semester: &str, teacher_id: &str) -> String {
        let result = self.call_ok(
            "courses.create",
            json!({
                "code": code,
                "name": format!("{} course", code),
                "semester": semester,
                "credits": 4,
                "teacherId": teacher_id,
            }),
        );
        result["courseId"].as_str().expect("course id").to_string()
    }

    pub fn enroll<S: AsRef<str>>(&mut self, course_id: &str, student_ids: &[S]) {
        let ids: Vec<&str> = student_ids.iter().map(|s| s.as_ref()).collect();
        self.call_ok(
            "courses.enroll",
            json!({ "courseId": course_id, "studentIds": ids }),
        );
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// `YYYY-MM-DD` for `days` before today (UTC).
pub fn days_ago(days: i64) -> String {
    (chrono::Utc::now().date_naive() - chrono::Duration::days(days)).to_string()
}
