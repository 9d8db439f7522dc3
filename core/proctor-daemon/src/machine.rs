//! Session state machine.
//!
//! `reduce` is pure: it maps the current session plus one event to the next
//! session and the side effects the caller must persist and dispatch. The
//! caller holds the session's lock across reduce, persist and publish, so a
//! score change and its status change are never observed apart.
//!
//! ```text
//! active ──score>flag──▶ flagged
//!   │  └────────────┬────────┘
//!   │    count>=block▼
//!   │            blocked ──approve──▶ active
//!   │               └────reject────▶ terminated
//!   └──end (active/flagged)──▶ completed
//! ```

use chrono::{DateTime, Utc};
use proctor_protocol::{Decision, ReviewDecision, SessionStatus};
use serde_json::Value;

use crate::config::PolicyConfig;
use crate::error::{ProctorError, Result};
use crate::scoring::risk_score;
use crate::session::{ProctoringSession, ReviewRequest, Violation, ViolationCandidate};

pub const AUTO_REVIEW_REASON: &str = "violation threshold reached";

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Violation(ViolationCandidate),
    RequestReview {
        reason: String,
        violations: Option<Value>,
        risk_score: Option<u32>,
    },
    Decide {
        decision: Decision,
        mentor_id: String,
        comments: Option<String>,
    },
    End {
        recordings: Option<Value>,
    },
    ForceTerminate {
        mentor_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    ViolationAppended(u32),
    ReviewOpened(u32),
    ReviewDecided(u32),
    Closed(SessionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Terminal sessions are immutable; the caller answers with current state.
    Terminal,
    /// A request is already pending for this block episode.
    ReviewPending,
    /// The candidate cannot close a session that is under escalation.
    EscalationInProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Apply {
        session: Box<ProctoringSession>,
        effects: Vec<Effect>,
    },
    Skip(SkipReason),
}

pub fn reduce(
    current: &ProctoringSession,
    event: SessionEvent,
    policy: &PolicyConfig,
    now: DateTime<Utc>,
) -> Result<SessionUpdate> {
    if current.status.is_terminal() {
        return Ok(SessionUpdate::Skip(SkipReason::Terminal));
    }

    match event {
        SessionEvent::Violation(candidate) => Ok(apply_violation(current, candidate, policy, now)),
        SessionEvent::RequestReview {
            reason,
            violations,
            risk_score,
        } => request_review(current, reason, violations, risk_score, now),
        SessionEvent::Decide {
            decision,
            mentor_id,
            comments,
        } => decide(current, decision, mentor_id, comments, now),
        SessionEvent::End { recordings } => Ok(end(current, recordings, now)),
        SessionEvent::ForceTerminate { mentor_id, reason } => {
            if current.status == SessionStatus::Blocked && current.pending_review().is_some() {
                // The only exit from a pending block is a decision.
                return decide(current, Decision::Reject, mentor_id, Some(reason), now);
            }
            let mut next = current.clone();
            next.status = SessionStatus::Terminated;
            next.ended_at = Some(now);
            next.updated_at = now;
            Ok(SessionUpdate::Apply {
                session: Box::new(next),
                effects: vec![Effect::Closed(SessionStatus::Terminated)],
            })
        }
    }
}

fn apply_violation(
    current: &ProctoringSession,
    candidate: ViolationCandidate,
    policy: &PolicyConfig,
    now: DateTime<Utc>,
) -> SessionUpdate {
    let mut next = current.clone();
    let seq = next.violations.len() as u32 + 1;
    *next
        .behavior
        .entry(candidate.violation_type.clone())
        .or_insert(0) += 1;
    next.violations.push(Violation {
        seq,
        violation_type: candidate.violation_type,
        severity: candidate.severity,
        description: candidate.description,
        metadata: candidate.metadata,
        recorded_at: now,
    });
    next.risk_score = risk_score(&next.violations, &policy.weights).max(current.risk_score);
    next.updated_at = now;

    let mut effects = vec![Effect::ViolationAppended(seq)];
    let count = next.violations.len();

    if current.status == SessionStatus::Blocked || count >= policy.block_threshold {
        next.status = SessionStatus::Blocked;
        if next.pending_review().is_none() {
            let snapshot = violations_snapshot(&next.violations);
            let score = next.risk_score;
            let review_seq = open_review(&mut next, AUTO_REVIEW_REASON.to_string(), snapshot, score, now);
            effects.push(Effect::ReviewOpened(review_seq));
        }
    } else if next.risk_score > policy.flag_threshold {
        next.status = SessionStatus::Flagged;
    }

    SessionUpdate::Apply {
        session: Box::new(next),
        effects,
    }
}

fn request_review(
    current: &ProctoringSession,
    reason: String,
    violations: Option<Value>,
    risk_score: Option<u32>,
    now: DateTime<Utc>,
) -> Result<SessionUpdate> {
    if current.pending_review().is_some() {
        return Ok(SessionUpdate::Skip(SkipReason::ReviewPending));
    }
    if current.status != SessionStatus::Blocked {
        return Err(ProctorError::InvalidState {
            session_id: current.id.clone(),
            status: current.status,
            operation: "request_review",
        });
    }

    let mut next = current.clone();
    let snapshot = violations.unwrap_or_else(|| violations_snapshot(&current.violations));
    let score = risk_score.unwrap_or(current.risk_score);
    let seq = open_review(&mut next, reason, snapshot, score, now);
    next.updated_at = now;
    Ok(SessionUpdate::Apply {
        session: Box::new(next),
        effects: vec![Effect::ReviewOpened(seq)],
    })
}

fn decide(
    current: &ProctoringSession,
    decision: Decision,
    mentor_id: String,
    comments: Option<String>,
    now: DateTime<Utc>,
) -> Result<SessionUpdate> {
    let review = match current.current_review() {
        Some(review) => review,
        None => return Err(ProctorError::ReviewNotPending(current.id.clone())),
    };
    if !review.is_pending() {
        return Err(ProctorError::ReviewAlreadyDecided(current.id.clone()));
    }

    let seq = review.seq;
    let mut next = current.clone();
    let (outcome, status) = match decision {
        Decision::Approve => (ReviewDecision::Approved, SessionStatus::Active),
        Decision::Reject => (ReviewDecision::Rejected, SessionStatus::Terminated),
    };
    if let Some(review) = next.reviews.iter_mut().find(|review| review.seq == seq) {
        review.decision = outcome;
        review.decided_by = Some(mentor_id);
        review.decided_at = Some(now);
        review.comments = comments;
    }
    // Approval resumes the exam but keeps score and count: one more violation re-blocks.
    next.status = status;
    next.updated_at = now;

    let mut effects = vec![Effect::ReviewDecided(seq)];
    if status == SessionStatus::Terminated {
        next.ended_at = Some(now);
        effects.push(Effect::Closed(SessionStatus::Terminated));
    }
    Ok(SessionUpdate::Apply {
        session: Box::new(next),
        effects,
    })
}

fn end(current: &ProctoringSession, recordings: Option<Value>, now: DateTime<Utc>) -> SessionUpdate {
    if current.status == SessionStatus::Blocked {
        return SessionUpdate::Skip(SkipReason::EscalationInProgress);
    }

    let mut next = current.clone();
    next.status = SessionStatus::Completed;
    next.ended_at = Some(now);
    next.updated_at = now;
    if recordings.is_some() {
        next.recordings = recordings;
    }
    SessionUpdate::Apply {
        session: Box::new(next),
        effects: vec![Effect::Closed(SessionStatus::Completed)],
    }
}

fn open_review(
    session: &mut ProctoringSession,
    reason: String,
    violations_snapshot: Value,
    risk_score_snapshot: u32,
    now: DateTime<Utc>,
) -> u32 {
    let seq = session.reviews.len() as u32 + 1;
    session.reviews.push(ReviewRequest {
        seq,
        reason,
        violations_snapshot,
        risk_score_snapshot,
        requested_at: now,
        decision: ReviewDecision::Pending,
        decided_by: None,
        decided_at: None,
        comments: None,
    });
    seq
}

fn violations_snapshot(violations: &[Violation]) -> Value {
    serde_json::to_value(violations).unwrap_or(Value::Array(Vec::new()))
}

/// Checks the post-violation invariants. Returns a description of the first
/// broken rule.
pub fn violation_invariant_breach(
    session: &ProctoringSession,
    policy: &PolicyConfig,
) -> Option<&'static str> {
    let escalated = matches!(
        session.status,
        SessionStatus::Blocked | SessionStatus::Terminated
    );
    if session.violation_count() >= policy.block_threshold && !escalated {
        return Some("violation count at block threshold without block");
    }
    if session.risk_score > policy.flag_threshold
        && !escalated
        && session.status != SessionStatus::Flagged
    {
        return Some("risk score above flag threshold without flag");
    }
    None
}
