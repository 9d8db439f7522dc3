//! Client helper for talking to the proctoring daemon.
//!
//! The daemon is the only writer. Every call is one request/response
//! exchange over the Unix socket; streaming calls keep the connection open
//! and hand it back as a [`StreamConnection`].

use chrono::Utc;
use proctor_protocol::{
    ActiveSessionView, DecideReviewParams, Decision, DecisionAck, ErrorInfo, Identity, Method,
    RelayMessage, Request, Response, ReviewAck, ReviewStatusView, SessionEnded, SessionSettings,
    SessionStarted, TerminationAck, ViolationOutcome, ViolationParams, MAX_REQUEST_BYTES,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::env;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const SOCKET_ENV: &str = "PROCTOR_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error("Daemon transport failed: {0}")]
    Transport(String),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Daemon rejected request: {0}")]
    Daemon(ErrorInfo),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Frame source unavailable: {0}")]
    FrameSource(String),
}

impl AgentError {
    /// Wire error code when the daemon answered with an error.
    pub fn code(&self) -> Option<&str> {
        match self {
            AgentError::Daemon(info) => Some(info.code.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: PathBuf,
    identity: Option<Identity>,
}

impl DaemonClient {
    pub fn new(identity: Option<Identity>) -> Result<Self, AgentError> {
        Ok(Self::with_socket(socket_path()?, identity))
    }

    pub fn with_socket(socket: PathBuf, identity: Option<Identity>) -> Self {
        Self { socket, identity }
    }

    /// One request/response exchange, decoded into `T`.
    pub fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
    ) -> Result<T, AgentError> {
        let mut request = Request::new(method, self.identity.clone(), params);
        request.id = Some(make_request_id());
        let response = self.send_with_retry(&request)?;
        response.into_data().map_err(AgentError::Daemon)
    }

    pub fn health(&self) -> Result<Value, AgentError> {
        self.call(Method::GetHealth, None)
    }

    pub fn start_session(
        &self,
        exam_id: &str,
        environment_check: Option<Value>,
    ) -> Result<SessionStarted, AgentError> {
        let mut params = json!({ "exam_id": exam_id });
        if let Some(check) = environment_check {
            params["environment_check"] = check;
        }
        self.call(Method::StartSession, Some(params))
    }

    pub fn record_violation(&self, params: &ViolationParams) -> Result<ViolationOutcome, AgentError> {
        self.call(Method::RecordViolation, Some(serde_json::to_value(params)?))
    }

    pub fn end_session(&self, session_id: &str) -> Result<SessionEnded, AgentError> {
        self.call(Method::EndSession, Some(json!({ "session_id": session_id })))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Value, AgentError> {
        self.call(Method::GetSession, Some(json!({ "session_id": session_id })))
    }

    pub fn session_settings(&self, exam_id: &str) -> Result<SessionSettings, AgentError> {
        self.call(Method::GetSessionSettings, Some(json!({ "exam_id": exam_id })))
    }

    pub fn request_review(&self, session_id: &str, reason: &str) -> Result<ReviewAck, AgentError> {
        self.call(
            Method::RequestReview,
            Some(json!({ "session_id": session_id, "reason": reason })),
        )
    }

    pub fn review_status(&self, session_id: &str) -> Result<ReviewStatusView, AgentError> {
        self.call(Method::GetReviewStatus, Some(json!({ "session_id": session_id })))
    }

    pub fn decide_review(
        &self,
        session_id: &str,
        decision: Decision,
        comments: Option<String>,
    ) -> Result<DecisionAck, AgentError> {
        let params = DecideReviewParams {
            session_id: session_id.to_string(),
            decision,
            comments,
        };
        self.call(Method::DecideReview, Some(serde_json::to_value(params)?))
    }

    pub fn active_sessions(&self) -> Result<Vec<ActiveSessionView>, AgentError> {
        self.call(Method::GetActiveSessions, None)
    }

    pub fn terminate_exam(&self, session_id: &str, reason: &str) -> Result<TerminationAck, AgentError> {
        self.call(
            Method::TerminateExam,
            Some(json!({ "session_id": session_id, "reason": reason })),
        )
    }

    /// Opens a streaming call. The returned connection has already consumed
    /// the daemon's `ok` line; `ack` holds its payload.
    pub fn open_stream(&self, method: Method, params: Value) -> Result<StreamConnection, AgentError> {
        let mut request = Request::new(method, self.identity.clone(), Some(params));
        request.id = Some(make_request_id());

        let mut stream = self.connect_with_retry()?;
        write_json_line(&mut stream, &request)?;

        let mut reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|err| AgentError::Transport(format!("Failed to clone stream: {}", err)))?,
        );
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return Err(AgentError::Transport("Daemon closed stream before ack".to_string())),
            Ok(_) => {}
            Err(err) if is_timeout(&err) => return Err(AgentError::Timeout),
            Err(err) => return Err(AgentError::Transport(format!("Failed to read ack: {}", err))),
        }
        let response: Response = serde_json::from_str(line.trim_end())
            .map_err(|err| AgentError::Transport(format!("Failed to parse ack JSON: {}", err)))?;
        let ack = response.into_data::<Value>().map_err(AgentError::Daemon)?;

        // Past the ack, reads block until the daemon has something to say.
        let _ = stream.set_read_timeout(None);
        Ok(StreamConnection {
            writer: stream,
            reader: RelayReader { inner: reader },
            ack,
        })
    }

    fn send_with_retry(&self, request: &Request) -> Result<Response, AgentError> {
        let mut stream = self.connect_with_retry()?;
        write_json_line(&mut stream, request)?;
        read_response(&mut stream)
    }

    fn connect_with_retry(&self) -> Result<UnixStream, AgentError> {
        match self.connect() {
            Ok(stream) => Ok(stream),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to connect to daemon; retrying");
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                self.connect().map_err(|retry_err| {
                    tracing::warn!(error = %retry_err, "Retry failed connecting to daemon");
                    retry_err
                })
            }
        }
    }

    fn connect(&self) -> Result<UnixStream, AgentError> {
        let stream = UnixStream::connect(&self.socket).map_err(|source| AgentError::Connect {
            path: self.socket.clone(),
            source,
        })?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        Ok(stream)
    }
}

/// An open streaming connection.
pub struct StreamConnection {
    pub writer: UnixStream,
    pub reader: RelayReader,
    pub ack: Value,
}

impl StreamConnection {
    pub fn send(&mut self, message: &RelayMessage) -> Result<(), AgentError> {
        write_json_line(&mut self.writer, message)
    }

    pub fn next_message(&mut self) -> Result<Option<RelayMessage>, AgentError> {
        self.reader.next_message()
    }
}

/// Reads newline-delimited relay messages; `None` means the daemon closed
/// the connection.
pub struct RelayReader {
    inner: BufReader<UnixStream>,
}

impl RelayReader {
    pub fn next_message(&mut self) -> Result<Option<RelayMessage>, AgentError> {
        loop {
            let mut line = Vec::new();
            let read = (&mut self.inner)
                .take(MAX_REQUEST_BYTES as u64 * 2)
                .read_until(b'\n', &mut line)
                .map_err(|err| AgentError::Transport(format!("Failed to read relay line: {}", err)))?;
            if read == 0 {
                return Ok(None);
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return proctor_protocol::parse_relay_line(&line)
                .map(Some)
                .map_err(AgentError::Daemon);
        }
    }
}

fn socket_path() -> Result<PathBuf, AgentError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(AgentError::NoHome)?;
    Ok(home.join(".proctor").join(SOCKET_NAME))
}

fn write_json_line<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> Result<(), AgentError> {
    let mut payload = serde_json::to_vec(value)?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|err| AgentError::Transport(format!("Failed to write request: {}", err)))?;
    stream.flush().ok();
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, AgentError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(AgentError::Transport("Response exceeded maximum size".to_string()));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if is_timeout(&err) => return Err(AgentError::Timeout),
            Err(err) => return Err(AgentError::Transport(format!("Failed to read response: {}", err))),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(AgentError::Transport("Daemon response was empty".to_string()));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| AgentError::Transport(format!("Failed to parse response JSON: {}", err)))
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "req-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}
