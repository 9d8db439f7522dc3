//! Error taxonomy for proctoring operations.
//!
//! Every variant maps to a stable wire code so clients can branch on
//! `error.code` without parsing messages.

use proctor_protocol::{ErrorInfo, SessionStatus};

#[derive(Debug, thiserror::Error)]
pub enum ProctorError {
    // ─────────────────────────────────────────────────────────────────────
    // Input Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("{0}")]
    InvalidInput(ErrorInfo),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Exam not found: {0}")]
    ExamNotFound(String),

    #[error("Proctoring is disabled for exam {0}")]
    ProctoringDisabled(String),

    // ─────────────────────────────────────────────────────────────────────
    // Workflow Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No pending review for session {0}")]
    ReviewNotPending(String),

    #[error("Review for session {0} was already decided")]
    ReviewAlreadyDecided(String),

    #[error("Session {session_id} is {}; {operation} is not allowed", status.as_str())]
    InvalidState {
        session_id: String,
        status: SessionStatus,
        operation: &'static str,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // ─────────────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProctorError {
    pub fn code(&self) -> &str {
        match self {
            ProctorError::InvalidInput(info) => info.code.as_str(),
            ProctorError::SessionNotFound(_) => "session_not_found",
            ProctorError::ExamNotFound(_) => "exam_not_found",
            ProctorError::ProctoringDisabled(_) => "proctoring_disabled",
            ProctorError::ReviewNotPending(_) => "review_not_pending",
            ProctorError::ReviewAlreadyDecided(_) => "review_already_decided",
            ProctorError::InvalidState { .. } => "invalid_state",
            ProctorError::Unauthorized(_) => "unauthorized",
            ProctorError::Storage(_) => "storage_error",
            ProctorError::Internal(_) => "internal_error",
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            ProctorError::InvalidInput(info) => info.clone(),
            other => ErrorInfo::new(other.code(), other.to_string()),
        }
    }
}

impl From<ErrorInfo> for ProctorError {
    fn from(info: ErrorInfo) -> Self {
        ProctorError::InvalidInput(info)
    }
}

pub type Result<T> = std::result::Result<T, ProctorError>;
