//! Index of live sessions for monitoring dashboards.
//!
//! Entries are immutable snapshots replaced wholesale, so a reader never sees
//! a score from one transition next to the status of another.

use chrono::{DateTime, Utc};
use proctor_protocol::{ActiveSessionView, SessionStatus};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::session::ProctoringSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub session_id: String,
    pub candidate_id: String,
    pub exam_id: String,
    pub status: SessionStatus,
    pub risk_score: u32,
    pub violation_count: usize,
    pub last_violation: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn from_session(session: &ProctoringSession) -> Self {
        Self {
            session_id: session.id.clone(),
            candidate_id: session.candidate_id.clone(),
            exam_id: session.exam_id.clone(),
            status: session.status,
            risk_score: session.risk_score,
            violation_count: session.violation_count(),
            last_violation: session
                .last_violation()
                .map(|violation| violation.violation_type.clone()),
            started_at: session.started_at,
        }
    }

    fn view(&self, now: DateTime<Utc>) -> ActiveSessionView {
        ActiveSessionView {
            session_id: self.session_id.clone(),
            candidate_id: self.candidate_id.clone(),
            exam_id: self.exam_id.clone(),
            status: self.status,
            risk_score: self.risk_score,
            violation_count: self.violation_count,
            duration_seconds: now.signed_duration_since(self.started_at).num_seconds().max(0),
            last_violation: self.last_violation.clone(),
            started_at: self.started_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the session's current state. Terminal sessions are removed.
    pub fn publish(&self, session: &ProctoringSession) {
        if session.status.is_terminal() {
            self.remove(&session.id);
            return;
        }

        let entry = Arc::new(RegistryEntry::from_session(session));
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(entry.session_id.clone(), entry);
            }
            Err(_) => tracing::warn!(session_id = %session.id, "Session registry lock poisoned"),
        }
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(session_id).is_some())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn get(&self, session_id: &str) -> Option<Arc<RegistryEntry>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(session_id).cloned())
    }

    /// Dashboard feed, highest risk first.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<ActiveSessionView> {
        let entries: Vec<Arc<RegistryEntry>> = match self.entries.read() {
            Ok(entries) => entries.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };

        let mut views: Vec<ActiveSessionView> = entries.iter().map(|entry| entry.view(now)).collect();
        views.sort_by(|a, b| {
            b.risk_score
                .cmp(&a.risk_score)
                .then_with(|| a.started_at.cmp(&b.started_at))
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        views
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }
}
