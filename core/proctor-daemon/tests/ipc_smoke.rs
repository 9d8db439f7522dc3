use proctor_protocol::{Identity, Method, Request, Response, Role, PROTOCOL_VERSION};
use rusqlite::params;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CONFIG: &str = r#"
[[exams]]
id = "exam-1"
title = "Algorithms midterm"
mentors = ["mentor-1"]

[[exams]]
id = "exam-off"
proctoring_enabled = false
"#;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_config(home: &Path) {
    let dir = home.join(".proctor").join("daemon");
    std::fs::create_dir_all(&dir).expect("create config dir");
    std::fs::write(dir.join("proctor.toml"), CONFIG).expect("write config");
}

fn spawn_daemon(home: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_proctor-daemon"))
        .env("HOME", home)
        .env_remove("PROCTOR_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn proctor-daemon");
    DaemonGuard { child }
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".proctor").join("daemon.sock")
}

fn db_path(home: &Path) -> PathBuf {
    home.join(".proctor").join("daemon").join("proctor.db")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn send_raw(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    stream.write_all(payload).expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut payload = serde_json::to_vec(&request).expect("Failed to serialize request");
    payload.push(b'\n');
    send_raw(socket, &payload)
}

fn call(socket: &Path, method: Method, identity: Option<Identity>, params: Value) -> Response {
    send_request(socket, Request::new(method, identity, Some(params)))
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn candidate() -> Option<Identity> {
    Some(Identity {
        user_id: "cand-1".to_string(),
        role: Role::Candidate,
    })
}

fn mentor() -> Option<Identity> {
    Some(Identity {
        user_id: "mentor-1".to_string(),
        role: Role::Mentor,
    })
}

fn data(response: Response) -> Value {
    assert!(response.ok, "expected ok response, got {:?}", response.error);
    response.data.unwrap_or(Value::Null)
}

fn error_code(response: &Response) -> &str {
    response
        .error
        .as_ref()
        .map(|err| err.code.as_str())
        .unwrap_or("missing")
}

fn start_session(socket: &Path) -> String {
    let started = data(call(
        socket,
        Method::StartSession,
        candidate(),
        json!({"exam_id": "exam-1", "environment_check": {"camera": true}}),
    ));
    assert_eq!(started["status"], "active");
    started["session_id"]
        .as_str()
        .expect("session_id")
        .to_string()
}

fn record(socket: &Path, session_id: &str, violation_type: &str, severity: &str) -> Value {
    data(call(
        socket,
        Method::RecordViolation,
        None,
        json!({
            "session_id": session_id,
            "violation_type": violation_type,
            "severity": severity,
            "description": format!("{} observed", violation_type),
            "metadata": {"source": "dom"},
        }),
    ))
}

fn block_session(socket: &Path, session_id: &str) {
    for kind in ["tab_switch", "copy_paste", "fullscreen_exit", "window_resize"] {
        record(socket, session_id, kind, "medium");
    }
    let fifth = record(socket, session_id, "right_click", "low");
    assert_eq!(fifth["status"], "blocked");
}

#[test]
fn daemon_ipc_proctoring_lifecycle_smoke() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(home.path());
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let health = data(send_request(
        &socket,
        Request::new(Method::GetHealth, None, None),
    ));
    assert_eq!(health["status"], "ok");
    assert_eq!(health["protocol_version"], PROTOCOL_VERSION);
    assert_eq!(health["sessions"], 0);
    assert_eq!(health["streams"], 0);
    assert!(health["pid"].as_u64().is_some());

    let settings = data(call(
        &socket,
        Method::GetSessionSettings,
        None,
        json!({"exam_id": "exam-1"}),
    ));
    assert_eq!(settings["title"], "Algorithms midterm");
    assert_eq!(settings["violation_threshold"], 5);
    assert_eq!(settings["cooldown_secs"], 30);

    let session_id = start_session(&socket);

    let mut last = Value::Null;
    for kind in ["tab_switch", "copy_paste", "fullscreen_exit", "window_resize"] {
        last = record(&socket, &session_id, kind, "medium");
    }
    assert_eq!(last["risk_score"], 100);
    assert_eq!(last["status"], "flagged");
    assert_eq!(last["violation_count"], 4);

    // Same type inside the cooldown window is dropped.
    let duplicate = record(&socket, &session_id, "tab_switch", "medium");
    assert_eq!(duplicate["accepted"], false);
    assert_eq!(duplicate["violation_count"], 4);

    let fifth = record(&socket, &session_id, "right_click", "low");
    assert_eq!(fifth["status"], "blocked");
    assert_eq!(fifth["should_block"], true);

    let review = data(call(
        &socket,
        Method::GetReviewStatus,
        None,
        json!({"session_id": session_id}),
    ));
    assert_eq!(review["review"], "pending");

    let ended = data(call(
        &socket,
        Method::EndSession,
        candidate(),
        json!({"session_id": session_id}),
    ));
    assert_eq!(ended["status"], "blocked");

    let denied = call(
        &socket,
        Method::DecideReview,
        candidate(),
        json!({"session_id": session_id, "decision": "approve"}),
    );
    assert_eq!(error_code(&denied), "unauthorized");

    let decided = data(call(
        &socket,
        Method::DecideReview,
        mentor(),
        json!({"session_id": session_id, "decision": "approve", "comments": "false positive"}),
    ));
    assert_eq!(decided["status"], "active");
    assert_eq!(decided["decision"], "approved");

    let dashboard = data(call(&socket, Method::GetActiveSessions, mentor(), json!({})));
    let rows = dashboard.as_array().expect("dashboard rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["risk_score"], 100);
    assert_eq!(rows[0]["last_violation"], "right_click");

    let ended = data(call(
        &socket,
        Method::EndSession,
        candidate(),
        json!({"session_id": session_id, "recordings": {"video": "rec-1"}}),
    ));
    assert_eq!(ended["status"], "completed");
    assert_eq!(ended["violation_count"], 5);

    let detail = data(call(
        &socket,
        Method::GetSession,
        None,
        json!({"session_id": session_id}),
    ));
    assert_eq!(detail["violations"].as_array().map(Vec::len), Some(5));
    assert_eq!(detail["reviews"][0]["decided_by"], "mentor-1");

    let late = record(&socket, &session_id, "devtools_open", "critical");
    assert_eq!(late["accepted"], false);
    assert_eq!(late["status"], "completed");

    let conn = rusqlite::Connection::open(db_path(home.path())).expect("open db");
    let queued: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM notifications WHERE session_id = ?1 AND recipient = 'mentor-1' \
             AND kind = 'review_requested'",
            params![session_id],
            |row| row.get(0),
        )
        .expect("count notifications");
    assert_eq!(queued, 1);
}

#[test]
fn daemon_rejects_malformed_and_invalid_requests() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(home.path());
    let socket = socket_path(home.path());
    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let response = send_raw(&socket, b"{\"bad_json\": true\n");
    assert_eq!(error_code(&response), "invalid_json");

    let mut mismatched = Request::new(Method::GetHealth, None, None);
    mismatched.protocol_version = PROTOCOL_VERSION + 1;
    assert_eq!(error_code(&send_request(&socket, mismatched)), "protocol_mismatch");

    let response = send_request(&socket, Request::new(Method::RecordViolation, None, None));
    assert_eq!(error_code(&response), "invalid_params");

    let response = call(
        &socket,
        Method::RecordViolation,
        None,
        json!({"session_id": "missing", "violation_type": "tab_switch", "severity": "medium"}),
    );
    assert_eq!(error_code(&response), "session_not_found");

    let response = call(
        &socket,
        Method::StartSession,
        None,
        json!({"exam_id": "exam-1"}),
    );
    assert_eq!(error_code(&response), "missing_field");

    let response = call(
        &socket,
        Method::StartSession,
        candidate(),
        json!({"exam_id": "exam-off"}),
    );
    assert_eq!(error_code(&response), "proctoring_disabled");

    let session_id = start_session(&socket);
    let response = call(
        &socket,
        Method::RecordViolation,
        None,
        json!({"session_id": session_id, "violation_type": "tab switch!", "severity": "medium"}),
    );
    assert_eq!(error_code(&response), "invalid_params");

    let response = call(
        &socket,
        Method::RecordViolation,
        None,
        json!({"session_id": session_id, "violation_type": "tab_switch", "severity": "extreme"}),
    );
    assert_eq!(error_code(&response), "invalid_severity");

    let response = call(
        &socket,
        Method::RequestReview,
        None,
        json!({"session_id": session_id, "reason": "help"}),
    );
    assert_eq!(error_code(&response), "invalid_state");

    let health = send_request(&socket, Request::new(Method::GetHealth, None, None));
    assert!(health.ok, "daemon should stay healthy after rejected requests");
}

#[test]
fn daemon_recovers_blocked_sessions_after_restart() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(home.path());
    let socket = socket_path(home.path());

    let session_id = {
        let _guard = spawn_daemon(home.path());
        wait_for_socket(&socket, Duration::from_secs(5));
        let session_id = start_session(&socket);
        block_session(&socket, &session_id);
        session_id
    };

    let _guard = spawn_daemon(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let dashboard = data(call(&socket, Method::GetActiveSessions, mentor(), json!({})));
    let rows = dashboard.as_array().expect("dashboard rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["session_id"], session_id.as_str());
    assert_eq!(rows[0]["status"], "blocked");
    assert_eq!(rows[0]["violation_count"], 5);

    let review = data(call(
        &socket,
        Method::GetReviewStatus,
        None,
        json!({"session_id": session_id}),
    ));
    assert_eq!(review["review"], "pending");

    let decided = data(call(
        &socket,
        Method::DecideReview,
        mentor(),
        json!({"session_id": session_id, "decision": "reject"}),
    ));
    assert_eq!(decided["status"], "terminated");

    let again = call(
        &socket,
        Method::DecideReview,
        mentor(),
        json!({"session_id": session_id, "decision": "approve"}),
    );
    assert_eq!(error_code(&again), "review_already_decided");
}
