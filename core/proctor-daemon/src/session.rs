//! Proctoring session records.
//!
//! A session owns its violations and its review history. Both are
//! append-only: violations are never edited once recorded, and a new block
//! episode appends a new review request instead of overwriting the last one.

use chrono::{DateTime, Utc};
use proctor_protocol::{ReviewDecision, SessionStatus, Severity};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub seq: u32,
    pub violation_type: String,
    pub severity: Severity,
    pub description: String,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRequest {
    pub seq: u32,
    pub reason: String,
    pub violations_snapshot: Value,
    pub risk_score_snapshot: u32,
    pub requested_at: DateTime<Utc>,
    pub decision: ReviewDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

impl ReviewRequest {
    pub fn is_pending(&self) -> bool {
        self.decision == ReviewDecision::Pending
    }
}

/// A violation candidate as submitted by the signal producer, before
/// cooldown and sequencing.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationCandidate {
    pub violation_type: String,
    pub severity: Severity,
    pub description: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProctoringSession {
    pub id: String,
    pub exam_id: String,
    pub candidate_id: String,
    pub status: SessionStatus,
    pub risk_score: u32,
    pub violations: Vec<Violation>,
    pub environment_check: Value,
    /// Additive per-type counters (tab switches, gaze warnings, ...).
    pub behavior: BTreeMap<String, u64>,
    /// Review history, oldest first. The last entry is the current request.
    pub reviews: Vec<ReviewRequest>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordings: Option<Value>,
}

impl ProctoringSession {
    pub fn new(
        id: String,
        exam_id: String,
        candidate_id: String,
        environment_check: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            exam_id,
            candidate_id,
            status: SessionStatus::Active,
            risk_score: 0,
            violations: Vec::new(),
            environment_check,
            behavior: BTreeMap::new(),
            reviews: Vec::new(),
            started_at: now,
            updated_at: now,
            ended_at: None,
            recordings: None,
        }
    }

    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }

    pub fn current_review(&self) -> Option<&ReviewRequest> {
        self.reviews.last()
    }

    pub fn pending_review(&self) -> Option<&ReviewRequest> {
        self.current_review().filter(|review| review.is_pending())
    }

    pub fn last_violation(&self) -> Option<&Violation> {
        self.violations.last()
    }

    pub fn violation(&self, seq: u32) -> Option<&Violation> {
        self.violations.iter().find(|violation| violation.seq == seq)
    }

    pub fn review(&self, seq: u32) -> Option<&ReviewRequest> {
        self.reviews.iter().find(|review| review.seq == seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_session_starts_active_and_empty() {
        let now = Utc::now();
        let session = ProctoringSession::new(
            "s-1".to_string(),
            "exam-1".to_string(),
            "cand-1".to_string(),
            json!({"camera": true}),
            now,
        );
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.risk_score, 0);
        assert_eq!(session.violation_count(), 0);
        assert!(session.current_review().is_none());
        assert!(session.pending_review().is_none());
    }

    #[test]
    fn pending_review_only_reports_undecided_requests() {
        let now = Utc::now();
        let mut session = ProctoringSession::new(
            "s-1".to_string(),
            "exam-1".to_string(),
            "cand-1".to_string(),
            Value::Null,
            now,
        );
        session.reviews.push(ReviewRequest {
            seq: 1,
            reason: "threshold".to_string(),
            violations_snapshot: json!([]),
            risk_score_snapshot: 100,
            requested_at: now,
            decision: ReviewDecision::Approved,
            decided_by: Some("mentor-1".to_string()),
            decided_at: Some(now),
            comments: None,
        });
        assert!(session.current_review().is_some());
        assert!(session.pending_review().is_none());
    }
}
