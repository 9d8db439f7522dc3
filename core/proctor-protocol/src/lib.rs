//! IPC protocol types and validation for proctor-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests and decode responses.

use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_ID_LEN: usize = 128;
pub const MAX_DESCRIPTION_LEN: usize = 2048;

pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";
pub const ERROR_INVALID_PARAMS: &str = "invalid_params";
pub const ERROR_MISSING_FIELD: &str = "missing_field";
pub const ERROR_INVALID_SEVERITY: &str = "invalid_severity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    StartSession,
    RecordViolation,
    EndSession,
    GetSession,
    GetSessionSettings,
    RequestReview,
    GetReviewStatus,
    DecideReview,
    GetActiveSessions,
    JoinStream,
    PublishStream,
    TerminateExam,
}

impl Method {
    /// Streaming methods keep the connection open after the first response.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Method::JoinStream | Method::PublishStream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Candidate,
    Mentor,
    Admin,
}

impl Role {
    pub fn can_review(&self) -> bool {
        matches!(self, Role::Mentor | Role::Admin)
    }
}

/// Caller identity supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub identity: Option<Identity>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, identity: Option<Identity>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            identity,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }

    /// Decodes the `data` payload of a successful response.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, ErrorInfo> {
        if !self.ok {
            return Err(self
                .error
                .unwrap_or_else(|| ErrorInfo::new("unknown_error", "response was not ok")));
        }
        let data = self.data.unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|err| {
            ErrorInfo::new(
                "invalid_response",
                format!("response payload did not match schema: {}", err),
            )
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain vocabulary shared by daemon and clients
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Flagged,
    Blocked,
    Terminated,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Flagged => "flagged",
            SessionStatus::Blocked => "blocked",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "flagged" => Some(SessionStatus::Flagged),
            "blocked" => Some(SessionStatus::Blocked),
            "terminated" => Some(SessionStatus::Terminated),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Completed)
    }

    /// Blocked and terminated sessions suspend exam interaction on the client.
    pub fn suspends_exam(&self) -> bool {
        matches!(self, SessionStatus::Blocked | SessionStatus::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Pending,
    Approved,
    Rejected,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewDecision::Pending => "pending",
            ReviewDecision::Approved => "approved",
            ReviewDecision::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ReviewDecision::Pending),
            "approved" => Some(ReviewDecision::Approved),
            "rejected" => Some(ReviewDecision::Rejected),
            _ => None,
        }
    }
}

/// What a polling candidate sees: the current request's decision, or `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    None,
    Pending,
    Approved,
    Rejected,
}

impl From<ReviewDecision> for ReviewState {
    fn from(decision: ReviewDecision) -> Self {
        match decision {
            ReviewDecision::Pending => ReviewState::Pending,
            ReviewDecision::Approved => ReviewState::Approved,
            ReviewDecision::Rejected => ReviewState::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

// ─────────────────────────────────────────────────────────────────────────────
// Request params
// ─────────────────────────────────────────────────────────────────────────────

/// Request parameter payloads validate themselves after deserialization.
pub trait Params: DeserializeOwned {
    /// Checks on the raw object that need a more specific error code than a
    /// failed deserialization gives.
    fn precheck(_raw: &Value) -> Result<(), ErrorInfo> {
        Ok(())
    }

    fn validate(&self) -> Result<(), ErrorInfo>;
}

pub fn parse_params<T: Params>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new(ERROR_INVALID_PARAMS, "params are required"))?;
    if !params.is_object() {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "params must be an object",
        ));
    }
    T::precheck(&params)?;
    let parsed: T = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("params are invalid: {}", err),
        )
    })?;
    parsed.validate()?;
    Ok(parsed)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartSessionParams {
    pub exam_id: String,
    #[serde(default)]
    pub environment_check: Option<Value>,
}

impl Params for StartSessionParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.exam_id, "exam_id")?;
        require_object_or_absent(&self.environment_check, "environment_check")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViolationParams {
    pub session_id: String,
    pub violation_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl Params for ViolationParams {
    fn precheck(raw: &Value) -> Result<(), ErrorInfo> {
        match raw.get("severity") {
            None => Ok(()),
            Some(Value::String(value)) if Severity::parse(value).is_some() => Ok(()),
            Some(other) => Err(ErrorInfo::new(
                ERROR_INVALID_SEVERITY,
                format!("unknown severity {} (expected low, medium, high or critical)", other),
            )),
        }
    }

    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        require_id(&self.violation_type, "violation_type")?;
        if !self
            .violation_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ErrorInfo::new(
                ERROR_INVALID_PARAMS,
                "violation_type must be a snake_case tag",
            ));
        }
        if let Some(description) = &self.description {
            if description.len() > MAX_DESCRIPTION_LEN {
                return Err(ErrorInfo::new(
                    ERROR_INVALID_PARAMS,
                    "description is too long",
                ));
            }
        }
        require_object_or_absent(&self.metadata, "metadata")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndSessionParams {
    pub session_id: String,
    #[serde(default)]
    pub recordings: Option<Value>,
}

impl Params for EndSessionParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRef {
    pub session_id: String,
}

impl Params for SessionRef {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExamRef {
    pub exam_id: String,
}

impl Params for ExamRef {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.exam_id, "exam_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestReviewParams {
    pub session_id: String,
    pub reason: String,
    #[serde(default)]
    pub violations: Option<Value>,
    #[serde(default)]
    pub risk_score: Option<u32>,
}

impl Params for RequestReviewParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        require_text(&self.reason, "reason")?;
        if let Some(violations) = &self.violations {
            if !violations.is_array() {
                return Err(ErrorInfo::new(
                    ERROR_INVALID_PARAMS,
                    "violations must be an array",
                ));
            }
        }
        if matches!(self.risk_score, Some(score) if score > 100) {
            return Err(ErrorInfo::new(
                ERROR_INVALID_PARAMS,
                "risk_score must be within 0..=100",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecideReviewParams {
    pub session_id: String,
    pub decision: Decision,
    #[serde(default)]
    pub comments: Option<String>,
}

impl Params for DecideReviewParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        if let Some(comments) = &self.comments {
            if comments.len() > MAX_DESCRIPTION_LEN {
                return Err(ErrorInfo::new(ERROR_INVALID_PARAMS, "comments are too long"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinStreamParams {
    pub session_id: String,
    #[serde(default)]
    pub viewer_id: Option<String>,
}

impl Params for JoinStreamParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        if let Some(viewer_id) = &self.viewer_id {
            require_id(viewer_id, "viewer_id")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminateExamParams {
    pub session_id: String,
    pub reason: String,
}

impl Params for TerminateExamParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        require_text(&self.reason, "reason")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStarted {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationOutcome {
    pub risk_score: u32,
    pub status: SessionStatus,
    pub violation_count: usize,
    pub should_block: bool,
    /// False when the candidate was dropped by cooldown or the session is terminal.
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnded {
    pub session_id: String,
    pub status: SessionStatus,
    pub risk_score: u32,
    pub violation_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStatusView {
    pub session_id: String,
    pub review: ReviewState,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewAck {
    pub session_id: String,
    /// False when a pending request already existed for this block episode.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionAck {
    pub session_id: String,
    pub status: SessionStatus,
    pub decision: ReviewDecision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationAck {
    pub session_id: String,
    /// Whether a connected candidate producer received the control message.
    pub delivered: bool,
    pub status: SessionStatus,
}

/// Dashboard row for a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSessionView {
    pub session_id: String,
    pub candidate_id: String,
    pub exam_id: String,
    pub status: SessionStatus,
    pub risk_score: u32,
    pub violation_count: usize,
    pub duration_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_violation: Option<String>,
    pub started_at: String,
}

/// Flag bag consumed by the client-side signal producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub exam_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub proctoring_enabled: bool,
    pub camera_required: bool,
    pub microphone_required: bool,
    pub screen_share_required: bool,
    pub fullscreen_required: bool,
    pub violation_threshold: usize,
    pub face_check_interval_secs: u64,
    pub frame_interval_secs: u64,
    pub cooldown_secs: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay line messages
// ─────────────────────────────────────────────────────────────────────────────

/// Newline-delimited messages exchanged on streaming connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Frame {
        session_id: String,
        /// Base64-encoded image bytes.
        data: String,
        timestamp: String,
        #[serde(default)]
        seq: u64,
    },
    Leave {},
    NoSignal {
        session_id: String,
    },
    StreamEnded {
        session_id: String,
        reason: String,
    },
    TerminateExam {
        session_id: String,
        reason: String,
    },
}

pub fn parse_relay_line(line: &[u8]) -> Result<RelayMessage, ErrorInfo> {
    let message: RelayMessage = serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("relay message was not valid JSON: {}", err),
        )
    })?;
    if let RelayMessage::Frame { timestamp, .. } = &message {
        if DateTime::parse_from_rfc3339(timestamp).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "frame timestamp must be RFC3339",
            ));
        }
    }
    Ok(message)
}

fn require_id(value: &str, field: &str) -> Result<(), ErrorInfo> {
    require_text(value, field)?;
    if value.len() > MAX_ID_LEN {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("{} must be {} characters or fewer", field, MAX_ID_LEN),
        ));
    }
    Ok(())
}

fn require_text(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            ERROR_MISSING_FIELD,
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn require_object_or_absent(value: &Option<Value>, field: &str) -> Result<(), ErrorInfo> {
    match value {
        None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("{} must be an object", field),
        )),
    }
}
