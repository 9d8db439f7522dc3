//! Proctoring daemon entrypoint.
//!
//! A single-writer service that owns proctoring session state: a socket
//! listener with strict request validation, per-session serialized
//! mutations persisted to SQLite, and a best-effort video relay.

use chrono::Utc;
use fs_err as fs;
use std::env;
use std::io::Read;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use proctor_protocol::{
    parse_params, DecideReviewParams, EndSessionParams, ErrorInfo, ExamRef, Method, Params,
    Request, RequestReviewParams, Response, SessionRef, StartSessionParams, TerminateExamParams,
    ViolationParams, ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;

mod config;
mod db;
mod error;
mod limits;
mod machine;
mod notify;
mod registry;
mod relay;
mod scoring;
mod session;
mod state;
mod stream;

use config::ProctorConfig;
use db::Db;
use error::ProctorError;
use limits::{ConnectionLimiter, ConnectionPermit};
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

struct Daemon {
    state: SharedState,
    requests: Arc<ConnectionLimiter>,
    streams: Arc<ConnectionLimiter>,
}

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let config = match config::load_runtime_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load proctor config; using defaults");
            ProctorConfig::default()
        }
    };
    info!(
        block_threshold = config.policy.block_threshold,
        flag_threshold = config.policy.flag_threshold,
        cooldown_secs = config.policy.cooldown_secs,
        exams = config.exams.len(),
        "Proctor config loaded"
    );

    let requests = ConnectionLimiter::new("requests", config.server.max_connections);
    let streams = ConnectionLimiter::new("streams", config.relay.max_stream_connections);
    let sweep_interval = config.server.sweep_interval_secs;
    let state = SharedState::new(db, config);
    match state.recover() {
        Ok(count) => info!(sessions = count, "Recovered live sessions"),
        Err(err) => warn!(error = %err, "Failed to recover live sessions"),
    }

    let daemon = Arc::new(Daemon {
        state,
        requests,
        streams,
    });
    spawn_session_sweeper(Arc::clone(&daemon), sweep_interval);

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };
    info!(path = %socket_path.display(), "Proctor daemon started");

    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                let permit = match daemon.requests.try_acquire() {
                    Some(permit) => permit,
                    None => {
                        reject_connection(&mut stream);
                        continue;
                    }
                };
                let daemon = Arc::clone(&daemon);
                thread::spawn(move || handle_connection(stream, daemon, permit));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_session_sweeper(daemon: Arc<Daemon>, interval_secs: u64) {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(interval_secs.max(1)));
        let report = daemon.state.sweep(Utc::now());
        if report.idle > 0 {
            info!(idle = report.idle, visited = report.visited, "Periodic session sweep");
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("PROCTOR_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".proctor").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".proctor").join("daemon").join("proctor.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn reject_connection(stream: &mut UnixStream) {
    let response = Response::error(
        None,
        ERROR_TOO_MANY_CONNECTIONS,
        "daemon connection limit reached",
    );
    let _ = stream::write_line(stream, &response);
}

fn handle_connection(mut stream: UnixStream, daemon: Arc<Daemon>, permit: ConnectionPermit) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = stream::write_line(&mut stream, &response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.protocol_version != PROTOCOL_VERSION {
        let response = Response::error(request.id, "protocol_mismatch", "unsupported protocol version");
        let _ = stream::write_line(&mut stream, &response);
        return;
    }

    if request.method.is_streaming() {
        // Long-lived connections move from the request pool to the stream pool.
        let stream_permit = match daemon.streams.try_acquire() {
            Some(stream_permit) => stream_permit,
            None => {
                let response = Response::error(
                    request.id,
                    ERROR_TOO_MANY_CONNECTIONS,
                    "relay connection limit reached",
                );
                let _ = stream::write_line(&mut stream, &response);
                return;
            }
        };
        drop(permit);
        match request.method {
            Method::JoinStream => stream::serve_viewer(stream, &daemon.state, request),
            _ => stream::serve_producer(stream, &daemon.state, request),
        }
        drop(stream_permit);
        return;
    }

    let response = handle_request(request, &daemon);
    let _ = stream::write_line(&mut stream, &response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    // Streaming clients may send relay lines right behind the request, so
    // only the first line is the request.
    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, daemon: &Daemon) -> Response {
    let state = &daemon.state;
    let identity = request.identity.as_ref();
    let now = Utc::now();

    match request.method {
        Method::GetHealth => {
            let counts = state.health();
            let data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "sessions": counts.sessions,
                "streams": counts.streams,
                "counts": counts,
                "security": {
                    "requests": daemon.requests.snapshot(),
                    "streams": daemon.streams.snapshot(),
                    "rejected_connections": daemon.requests.snapshot().rejected_connections
                        + daemon.streams.snapshot().rejected_connections,
                },
            });
            Response::ok(request.id, data)
        }
        Method::StartSession => run(request.id, request.params, |params: StartSessionParams| {
            state.start_session(identity, params, now)
        }),
        Method::RecordViolation => run(request.id, request.params, |params: ViolationParams| {
            state.record_violation(params, now)
        }),
        Method::EndSession => run(request.id, request.params, |params: EndSessionParams| {
            state.end_session(params, now)
        }),
        Method::GetSession => run(request.id, request.params, |params: SessionRef| {
            state.get_session(&params.session_id)
        }),
        Method::GetSessionSettings => run(request.id, request.params, |params: ExamRef| {
            state.session_settings(&params.exam_id)
        }),
        Method::RequestReview => run(request.id, request.params, |params: RequestReviewParams| {
            state.request_review(params, now)
        }),
        Method::GetReviewStatus => run(request.id, request.params, |params: SessionRef| {
            state.review_status(&params.session_id)
        }),
        Method::DecideReview => run(request.id, request.params, |params: DecideReviewParams| {
            state.decide_review(identity, params, now)
        }),
        Method::GetActiveSessions => {
            let sessions = state.active_sessions(now);
            tracing::debug!(sessions = sessions.len(), "Active sessions snapshot");
            respond(request.id, Ok(sessions))
        }
        Method::TerminateExam => run(request.id, request.params, |params: TerminateExamParams| {
            state.terminate_exam(identity, params, now)
        }),
        Method::JoinStream | Method::PublishStream => Response::error(
            request.id,
            "invalid_params",
            "streaming methods are served on their own connection",
        ),
    }
}

/// Validates params, runs the operation and serializes its result.
fn run<P, T, F>(id: Option<String>, params: Option<serde_json::Value>, op: F) -> Response
where
    P: Params,
    T: Serialize,
    F: FnOnce(P) -> error::Result<T>,
{
    match parse_params::<P>(params) {
        Ok(params) => respond(id, op(params)),
        Err(err) => Response::error_with_info(id, err),
    }
}

fn respond<T: Serialize>(id: Option<String>, result: error::Result<T>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize response: {}", err),
            ),
        },
        Err(err) => {
            log_failure(&err);
            Response::error_with_info(id, err.to_error_info())
        }
    }
}

fn log_failure(err: &ProctorError) {
    match err {
        ProctorError::Storage(_) | ProctorError::Internal(_) => {
            error!(code = err.code(), error = %err, "Request failed")
        }
        _ => tracing::debug!(code = err.code(), error = %err, "Request rejected"),
    }
}
