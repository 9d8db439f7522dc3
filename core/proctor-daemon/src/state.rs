//! Shared daemon state.
//!
//! Each live session sits behind its own mutex. The session map itself is
//! only locked long enough to find or insert a handle, so work on different
//! sessions never contends. Every mutation runs reduce, persist, swap and
//! registry publish while holding that one session's lock.

use chrono::{DateTime, Utc};
use proctor_protocol::{
    ActiveSessionView, DecideReviewParams, DecisionAck, EndSessionParams, ErrorInfo, Identity,
    RequestReviewParams, ReviewAck, ReviewDecision, ReviewState, ReviewStatusView, Role,
    SessionEnded, SessionSettings, SessionStarted, SessionStatus, StartSessionParams,
    TerminateExamParams, TerminationAck, ViolationOutcome, ViolationParams, ERROR_INVALID_PARAMS,
    ERROR_MISSING_FIELD, MAX_ID_LEN,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::ProctorConfig;
use crate::db::Db;
use crate::error::{ProctorError, Result};
use crate::machine::{reduce, violation_invariant_breach, Effect, SessionEvent, SessionUpdate};
use crate::notify::{Notification, NotificationKind, Notifier, OutboxNotifier, ALL_MENTORS};
use crate::registry::SessionRegistry;
use crate::relay::{VideoRelay, END_REASON_SESSION_CLOSED};
use crate::scoring::CooldownMap;
use crate::session::{ProctoringSession, ReviewRequest, ViolationCandidate};

struct SessionEntry {
    session: ProctoringSession,
    cooldowns: CooldownMap,
    last_activity: DateTime<Utc>,
}

impl SessionEntry {
    fn new(session: ProctoringSession) -> Self {
        let last_activity = session.updated_at;
        Self {
            session,
            cooldowns: CooldownMap::default(),
            last_activity,
        }
    }
}

type SessionHandle = Arc<Mutex<SessionEntry>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthCounts {
    pub sessions: usize,
    pub cached_sessions: usize,
    pub streams: usize,
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub visited: usize,
    pub pruned_cooldowns: usize,
    pub released: usize,
    pub idle: usize,
    pub closed_streams: usize,
}

pub struct SharedState {
    db: Db,
    config: ProctorConfig,
    registry: SessionRegistry,
    relay: VideoRelay,
    notifier: Arc<dyn Notifier>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SharedState {
    pub fn new(db: Db, config: ProctorConfig) -> Self {
        let notifier: Arc<dyn Notifier> = Arc::new(OutboxNotifier::new(db.clone()));
        Self::with_notifier(db, config, notifier)
    }

    pub fn with_notifier(db: Db, config: ProctorConfig, notifier: Arc<dyn Notifier>) -> Self {
        let relay = VideoRelay::new(config.relay.subscriber_buffer);
        Self {
            db,
            config,
            registry: SessionRegistry::new(),
            relay,
            notifier,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Reloads every non-terminal session from SQLite and re-registers it.
    pub fn recover(&self) -> std::result::Result<usize, String> {
        let live = self.db.list_live_sessions()?;
        let count = live.len();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| "Session map lock poisoned".to_string())?;
        for session in live {
            self.registry.publish(&session);
            sessions.insert(session.id.clone(), Arc::new(Mutex::new(SessionEntry::new(session))));
        }
        Ok(count)
    }

    pub fn config(&self) -> &ProctorConfig {
        &self.config
    }

    pub fn relay(&self) -> &VideoRelay {
        &self.relay
    }

    pub fn start_session(
        &self,
        identity: Option<&Identity>,
        params: StartSessionParams,
        now: DateTime<Utc>,
    ) -> Result<SessionStarted> {
        let candidate = require_candidate(identity)?;
        let settings = self.session_settings(&params.exam_id)?;
        if !settings.proctoring_enabled {
            return Err(ProctorError::ProctoringDisabled(params.exam_id));
        }

        let session = ProctoringSession::new(
            ulid::Ulid::new().to_string(),
            params.exam_id,
            candidate.user_id.clone(),
            params
                .environment_check
                .filter(|value| !value.is_null())
                .unwrap_or_else(|| json!({})),
            now,
        );
        self.db
            .persist(&session, &[])
            .map_err(ProctorError::Storage)?;

        self.registry.publish(&session);
        let started = SessionStarted {
            session_id: session.id.clone(),
            status: session.status,
        };
        info!(
            session_id = %session.id,
            exam_id = %session.exam_id,
            candidate_id = %session.candidate_id,
            "Proctoring session started"
        );
        self.sessions
            .write()
            .map_err(poisoned)?
            .insert(session.id.clone(), Arc::new(Mutex::new(SessionEntry::new(session))));
        Ok(started)
    }

    pub fn record_violation(
        &self,
        params: ViolationParams,
        now: DateTime<Utc>,
    ) -> Result<ViolationOutcome> {
        let handle = self.entry(&params.session_id)?;
        let mut entry = handle.lock().map_err(poisoned)?;

        if entry.session.status.is_terminal() {
            debug!(
                session_id = %params.session_id,
                status = entry.session.status.as_str(),
                "Violation ignored for terminal session"
            );
            return Ok(violation_outcome(&entry.session, false));
        }

        let cooldown = self.config.policy.cooldown();
        if entry
            .cooldowns
            .is_cooling(&params.violation_type, now, cooldown)
        {
            debug!(
                session_id = %params.session_id,
                violation_type = %params.violation_type,
                "Violation dropped by cooldown"
            );
            entry.last_activity = now;
            return Ok(violation_outcome(&entry.session, false));
        }

        let violation_type = params.violation_type.clone();
        let candidate = ViolationCandidate {
            violation_type: params.violation_type,
            severity: params.severity,
            description: params.description.unwrap_or_default(),
            metadata: params
                .metadata
                .filter(|value| !value.is_null())
                .unwrap_or_else(|| json!({})),
        };

        let update = reduce(
            &entry.session,
            SessionEvent::Violation(candidate),
            &self.config.policy,
            now,
        )?;
        let (next, effects) = match update {
            SessionUpdate::Apply { session, effects } => (*session, effects),
            SessionUpdate::Skip(_) => return Ok(violation_outcome(&entry.session, false)),
        };
        self.commit(&mut entry, next, &effects, now)?;
        entry.cooldowns.mark(&violation_type, now);

        let session = &entry.session;
        info!(
            session_id = %session.id,
            violation_type = %violation_type,
            status = session.status.as_str(),
            risk_score = session.risk_score,
            violation_count = session.violation_count(),
            "Violation accepted"
        );
        if let Some(breach) = violation_invariant_breach(session, &self.config.policy) {
            error!(session_id = %session.id, breach, "Session invariant violated");
        }
        Ok(violation_outcome(session, true))
    }

    pub fn end_session(&self, params: EndSessionParams, now: DateTime<Utc>) -> Result<SessionEnded> {
        let handle = self.entry(&params.session_id)?;
        let mut entry = handle.lock().map_err(poisoned)?;

        let update = reduce(
            &entry.session,
            SessionEvent::End {
                recordings: params.recordings.filter(|value| !value.is_null()),
            },
            &self.config.policy,
            now,
        )?;
        match update {
            SessionUpdate::Apply { session, effects } => {
                self.commit(&mut entry, *session, &effects, now)?;
            }
            SessionUpdate::Skip(reason) => {
                info!(
                    session_id = %params.session_id,
                    status = entry.session.status.as_str(),
                    reason = ?reason,
                    "End request left session unchanged"
                );
            }
        }

        let session = &entry.session;
        Ok(SessionEnded {
            session_id: session.id.clone(),
            status: session.status,
            risk_score: session.risk_score,
            violation_count: session.violation_count(),
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<ProctoringSession> {
        let handle = self.entry(session_id)?;
        let entry = handle.lock().map_err(poisoned)?;
        Ok(entry.session.clone())
    }

    /// Exam overrides merged over the configured defaults.
    pub fn session_settings(&self, exam_id: &str) -> Result<SessionSettings> {
        self.config
            .settings_for(exam_id)
            .ok_or_else(|| ProctorError::ExamNotFound(exam_id.to_string()))
    }

    pub fn request_review(
        &self,
        params: RequestReviewParams,
        now: DateTime<Utc>,
    ) -> Result<ReviewAck> {
        let handle = self.entry(&params.session_id)?;
        let mut entry = handle.lock().map_err(poisoned)?;

        let update = reduce(
            &entry.session,
            SessionEvent::RequestReview {
                reason: params.reason,
                violations: params.violations,
                risk_score: params.risk_score,
            },
            &self.config.policy,
            now,
        )?;
        let created = match update {
            SessionUpdate::Apply { session, effects } => {
                self.commit(&mut entry, *session, &effects, now)?;
                true
            }
            SessionUpdate::Skip(reason) => {
                debug!(session_id = %params.session_id, reason = ?reason, "Review request not created");
                false
            }
        };
        Ok(ReviewAck {
            session_id: params.session_id,
            created,
        })
    }

    pub fn review_status(&self, session_id: &str) -> Result<ReviewStatusView> {
        let handle = self.entry(session_id)?;
        let entry = handle.lock().map_err(poisoned)?;
        let review = entry
            .session
            .current_review()
            .map(|review| ReviewState::from(review.decision))
            .unwrap_or(ReviewState::None);
        Ok(ReviewStatusView {
            session_id: session_id.to_string(),
            review,
            status: entry.session.status,
        })
    }

    pub fn decide_review(
        &self,
        identity: Option<&Identity>,
        params: DecideReviewParams,
        now: DateTime<Utc>,
    ) -> Result<DecisionAck> {
        let mentor = authorize_reviewer(identity, "decide_review")?;
        let handle = self.entry(&params.session_id)?;
        let mut entry = handle.lock().map_err(poisoned)?;

        let update = reduce(
            &entry.session,
            SessionEvent::Decide {
                decision: params.decision,
                mentor_id: mentor.user_id.clone(),
                comments: params.comments,
            },
            &self.config.policy,
            now,
        )?;
        match update {
            SessionUpdate::Apply { session, effects } => {
                self.commit(&mut entry, *session, &effects, now)?;
            }
            SessionUpdate::Skip(_) => {
                // Terminal session: its last request, if any, was already answered.
                return Err(match entry.session.current_review() {
                    Some(review) if !review.is_pending() => {
                        ProctorError::ReviewAlreadyDecided(params.session_id)
                    }
                    _ => ProctorError::ReviewNotPending(params.session_id),
                });
            }
        }

        let decision = entry
            .session
            .current_review()
            .map(|review| review.decision)
            .unwrap_or(ReviewDecision::Pending);
        info!(
            session_id = %params.session_id,
            mentor_id = %mentor.user_id,
            decision = decision.as_str(),
            status = entry.session.status.as_str(),
            "Review decided"
        );
        Ok(DecisionAck {
            session_id: params.session_id,
            status: entry.session.status,
            decision,
        })
    }

    pub fn active_sessions(&self, now: DateTime<Utc>) -> Vec<ActiveSessionView> {
        self.registry.snapshot(now)
    }

    /// Hard stop from the live-monitoring view. The control message goes to
    /// the candidate's producer connection before the session is closed.
    pub fn terminate_exam(
        &self,
        identity: Option<&Identity>,
        params: TerminateExamParams,
        now: DateTime<Utc>,
    ) -> Result<TerminationAck> {
        let mentor = authorize_reviewer(identity, "terminate_exam")?;
        let handle = self.entry(&params.session_id)?;
        let mut entry = handle.lock().map_err(poisoned)?;

        let delivered = self.relay.terminate_exam(&params.session_id, &params.reason);
        let update = reduce(
            &entry.session,
            SessionEvent::ForceTerminate {
                mentor_id: mentor.user_id.clone(),
                reason: params.reason.clone(),
            },
            &self.config.policy,
            now,
        )?;
        if let SessionUpdate::Apply { session, effects } = update {
            self.commit(&mut entry, *session, &effects, now)?;
        }

        warn!(
            session_id = %params.session_id,
            mentor_id = %mentor.user_id,
            reason = %params.reason,
            delivered,
            status = entry.session.status.as_str(),
            "Exam terminated by mentor"
        );
        Ok(TerminationAck {
            session_id: params.session_id,
            delivered,
            status: entry.session.status,
        })
    }

    /// Streams are only opened for sessions that can still change.
    pub fn ensure_streamable(&self, session_id: &str, operation: &'static str) -> Result<()> {
        let handle = self.entry(session_id)?;
        let entry = handle.lock().map_err(poisoned)?;
        if entry.session.status.is_terminal() {
            return Err(ProctorError::InvalidState {
                session_id: session_id.to_string(),
                status: entry.session.status,
                operation,
            });
        }
        Ok(())
    }

    /// Periodic housekeeping. Holds at most one session lock at a time.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let handles: Vec<(String, SessionHandle)> = match self.sessions.read() {
            Ok(sessions) => sessions
                .iter()
                .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
                .collect(),
            Err(_) => {
                warn!("Session map lock poisoned; skipping sweep");
                return SweepReport::default();
            }
        };

        let cooldown = self.config.policy.cooldown();
        let inactivity = chrono::Duration::seconds(
            self.config.server.inactivity_warn_secs.min(i64::MAX as u64) as i64,
        );
        let mut report = SweepReport::default();
        let mut released = Vec::new();

        for (session_id, handle) in handles {
            let mut entry = match handle.lock() {
                Ok(entry) => entry,
                Err(_) => {
                    warn!(session_id = %session_id, "Session lock poisoned during sweep");
                    continue;
                }
            };
            report.visited += 1;
            report.pruned_cooldowns += entry.cooldowns.prune(now, cooldown);

            if entry.session.status.is_terminal() {
                entry.cooldowns.clear();
                self.registry.remove(&session_id);
                released.push(session_id);
                continue;
            }

            let idle = now.signed_duration_since(entry.last_activity);
            if idle >= inactivity {
                report.idle += 1;
                warn!(
                    session_id = %session_id,
                    status = entry.session.status.as_str(),
                    idle_secs = idle.num_seconds(),
                    "Session has no recent activity"
                );
            }
        }

        if !released.is_empty() {
            if let Ok(mut sessions) = self.sessions.write() {
                for session_id in &released {
                    sessions.remove(session_id);
                }
            }
        }
        report.released = released.len();

        for session_id in self.relay.session_ids() {
            if self.stream_outlived_session(&session_id)
                && self.relay.end_stream(&session_id, END_REASON_SESSION_CLOSED)
            {
                info!(session_id = %session_id, "Closed relay channel of a finished session");
                report.closed_streams += 1;
            }
        }

        if report.pruned_cooldowns > 0 || report.released > 0 || report.closed_streams > 0 {
            debug!(
                visited = report.visited,
                pruned_cooldowns = report.pruned_cooldowns,
                released = report.released,
                closed_streams = report.closed_streams,
                "Session sweep finished"
            );
        }
        report
    }

    /// A relay channel can be created for a session that closes in the same
    /// instant; such channels belong to terminal or unknown sessions.
    fn stream_outlived_session(&self, session_id: &str) -> bool {
        let cached = match self.sessions.read() {
            Ok(sessions) => sessions.get(session_id).cloned(),
            Err(_) => return false,
        };
        if let Some(handle) = cached {
            return handle
                .lock()
                .map(|entry| entry.session.status.is_terminal())
                .unwrap_or(false);
        }
        match self.db.load_session(session_id) {
            Ok(Some(session)) => session.status.is_terminal(),
            Ok(None) => true,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Failed to load session for relay cleanup");
                false
            }
        }
    }

    pub fn health(&self) -> HealthCounts {
        HealthCounts {
            sessions: self.registry.len(),
            cached_sessions: self.sessions.read().map(|map| map.len()).unwrap_or(0),
            streams: self.relay.channel_count(),
            frames_dropped: self.relay.frames_dropped(),
        }
    }

    fn entry(&self, session_id: &str) -> Result<SessionHandle> {
        let cached = {
            let sessions = self.sessions.read().map_err(poisoned)?;
            sessions.get(session_id).cloned()
        };
        if let Some(handle) = cached {
            return Ok(handle);
        }

        let session = self
            .db
            .load_session(session_id)
            .map_err(ProctorError::Storage)?
            .ok_or_else(|| ProctorError::SessionNotFound(session_id.to_string()))?;
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let handle = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new(session))));
        Ok(Arc::clone(handle))
    }

    /// Persists `next`, then swaps it in, publishes it and runs its side
    /// effects. On a storage failure the in-memory session is untouched.
    fn commit(
        &self,
        entry: &mut SessionEntry,
        next: ProctoringSession,
        effects: &[Effect],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Err(err) = self.db.persist(&next, effects) {
            warn!(session_id = %next.id, error = %err, "Failed to persist session update");
            return Err(ProctorError::Storage(err));
        }

        let previous = entry.session.status;
        entry.session = next;
        entry.last_activity = now;
        self.registry.publish(&entry.session);

        if previous != entry.session.status {
            info!(
                session_id = %entry.session.id,
                from = previous.as_str(),
                to = entry.session.status.as_str(),
                risk_score = entry.session.risk_score,
                violation_count = entry.session.violation_count(),
                "Session status changed"
            );
        }
        for effect in effects {
            self.dispatch(entry, *effect, now);
        }
        Ok(())
    }

    fn dispatch(&self, entry: &mut SessionEntry, effect: Effect, now: DateTime<Utc>) {
        match effect {
            Effect::ReviewOpened(seq) => {
                if let Some(review) = entry.session.review(seq) {
                    info!(
                        session_id = %entry.session.id,
                        review_seq = seq,
                        reason = %review.reason,
                        "Mentor review requested"
                    );
                    self.notify_mentors(&entry.session, review, now);
                }
            }
            Effect::Closed(status) => {
                entry.cooldowns.clear();
                self.relay.end_stream(&entry.session.id, END_REASON_SESSION_CLOSED);
                if status == SessionStatus::Terminated {
                    self.send(Notification {
                        recipient: entry.session.candidate_id.clone(),
                        kind: NotificationKind::SessionTerminated,
                        session_id: entry.session.id.clone(),
                        payload: json!({
                            "session_id": entry.session.id,
                            "exam_id": entry.session.exam_id,
                            "risk_score": entry.session.risk_score,
                            "violation_count": entry.session.violation_count(),
                        }),
                        created_at: now,
                    });
                }
            }
            Effect::ViolationAppended(_) | Effect::ReviewDecided(_) => {}
        }
    }

    fn notify_mentors(&self, session: &ProctoringSession, review: &ReviewRequest, now: DateTime<Utc>) {
        let recipients = match self.config.exam(&session.exam_id) {
            Some(exam) if !exam.mentors.is_empty() => exam.mentors.clone(),
            _ => vec![ALL_MENTORS.to_string()],
        };
        let payload: Value = json!({
            "session_id": session.id,
            "candidate_id": session.candidate_id,
            "exam_id": session.exam_id,
            "review_seq": review.seq,
            "reason": review.reason,
            "risk_score": review.risk_score_snapshot,
            "violation_count": session.violation_count(),
        });
        for recipient in recipients {
            self.send(Notification {
                recipient,
                kind: NotificationKind::ReviewRequested,
                session_id: session.id.clone(),
                payload: payload.clone(),
                created_at: now,
            });
        }
    }

    fn send(&self, notification: Notification) {
        if let Err(err) = self.notifier.notify(&notification) {
            warn!(
                session_id = %notification.session_id,
                recipient = %notification.recipient,
                error = %err,
                "Failed to hand off notification"
            );
        }
    }
}

/// Mentor/admin gate for review decisions and live-monitoring controls.
pub fn authorize_reviewer<'a>(identity: Option<&'a Identity>, operation: &str) -> Result<&'a Identity> {
    match identity {
        Some(identity) if identity.role.can_review() => Ok(identity),
        Some(identity) => Err(ProctorError::Unauthorized(format!(
            "{} may not {}",
            identity.user_id, operation
        ))),
        None => Err(ProctorError::Unauthorized(format!(
            "identity is required to {}",
            operation
        ))),
    }
}

fn require_candidate(identity: Option<&Identity>) -> Result<&Identity> {
    let identity = identity.ok_or_else(|| {
        ProctorError::InvalidInput(ErrorInfo::new(ERROR_MISSING_FIELD, "identity is required"))
    })?;
    if identity.user_id.trim().is_empty() {
        return Err(ProctorError::InvalidInput(ErrorInfo::new(
            ERROR_MISSING_FIELD,
            "identity.user_id is required",
        )));
    }
    if identity.user_id.len() > MAX_ID_LEN {
        return Err(ProctorError::InvalidInput(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "identity.user_id is too long",
        )));
    }
    if identity.role != Role::Candidate {
        return Err(ProctorError::Unauthorized(format!(
            "{} is not a candidate",
            identity.user_id
        )));
    }
    Ok(identity)
}

fn violation_outcome(session: &ProctoringSession, accepted: bool) -> ViolationOutcome {
    ViolationOutcome {
        risk_score: session.risk_score,
        status: session.status,
        violation_count: session.violation_count(),
        should_block: session.status.suspends_exam(),
        accepted,
    }
}

fn poisoned<T>(_: T) -> ProctorError {
    ProctorError::Internal("session lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExamConfig;
    use crate::relay::{ControlMessage, RelayEvent};
    use chrono::Duration;
    use proctor_protocol::{Decision, Severity};
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().expect("notifier lock").clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notification: &Notification) -> std::result::Result<(), String> {
            self.sent
                .lock()
                .map_err(|_| "poisoned".to_string())?
                .push(notification.clone());
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        db: Db,
        state: SharedState,
        notifier: Arc<RecordingNotifier>,
    }

    fn test_config() -> ProctorConfig {
        let mut config = ProctorConfig::default();
        config.exams.push(ExamConfig {
            id: "exam-1".to_string(),
            title: Some("Algorithms midterm".to_string()),
            mentors: vec!["mentor-1".to_string()],
            ..ExamConfig::default()
        });
        config.exams.push(ExamConfig {
            id: "exam-off".to_string(),
            proctoring_enabled: Some(false),
            ..ExamConfig::default()
        });
        config
    }

    fn harness_with(config: ProctorConfig) -> Harness {
        let dir = tempdir().expect("tempdir");
        let db = Db::new(dir.path().join("proctor.db")).expect("db");
        let notifier = Arc::new(RecordingNotifier::default());
        let shared: Arc<dyn Notifier> = notifier.clone();
        let state = SharedState::with_notifier(db.clone(), config, shared);
        Harness {
            _dir: dir,
            db,
            state,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    fn candidate() -> Identity {
        Identity {
            user_id: "cand-1".to_string(),
            role: Role::Candidate,
        }
    }

    fn mentor() -> Identity {
        Identity {
            user_id: "mentor-1".to_string(),
            role: Role::Mentor,
        }
    }

    fn start(state: &SharedState, now: DateTime<Utc>) -> String {
        state
            .start_session(
                Some(&candidate()),
                StartSessionParams {
                    exam_id: "exam-1".to_string(),
                    environment_check: Some(json!({"camera": true})),
                },
                now,
            )
            .expect("start session")
            .session_id
    }

    fn violation(session_id: &str, violation_type: &str, severity: Severity) -> ViolationParams {
        ViolationParams {
            session_id: session_id.to_string(),
            violation_type: violation_type.to_string(),
            severity,
            description: Some(format!("{} observed", violation_type)),
            metadata: Some(json!({"source": "test"})),
        }
    }

    fn decide(session_id: &str, decision: Decision) -> DecideReviewParams {
        DecideReviewParams {
            session_id: session_id.to_string(),
            decision,
            comments: Some("reviewed".to_string()),
        }
    }

    /// Four distinct medium violations, one second apart.
    fn record_four_medium(state: &SharedState, session_id: &str, base: DateTime<Utc>) -> Vec<ViolationOutcome> {
        ["tab_switch", "copy_paste", "fullscreen_exit", "window_resize"]
            .iter()
            .enumerate()
            .map(|(index, kind)| {
                state
                    .record_violation(
                        violation(session_id, kind, Severity::Medium),
                        base + Duration::seconds(index as i64),
                    )
                    .expect("record violation")
            })
            .collect()
    }

    fn block(state: &SharedState, session_id: &str, base: DateTime<Utc>) -> ViolationOutcome {
        record_four_medium(state, session_id, base);
        state
            .record_violation(
                violation(session_id, "right_click", Severity::Low),
                base + Duration::seconds(10),
            )
            .expect("fifth violation")
    }

    #[test]
    fn four_medium_violations_flag_without_blocking() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);

        let outcomes = record_four_medium(&h.state, &id, now);
        let scores: Vec<u32> = outcomes.iter().map(|o| o.risk_score).collect();
        assert_eq!(scores, vec![25, 50, 75, 100]);
        assert_eq!(outcomes[2].status, SessionStatus::Active);
        assert_eq!(outcomes[3].status, SessionStatus::Flagged);
        assert_eq!(outcomes[3].violation_count, 4);
        assert!(!outcomes[3].should_block);
        assert!(outcomes.iter().all(|o| o.accepted));
    }

    #[test]
    fn fifth_violation_blocks_and_notifies_exam_mentors() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);

        let outcome = block(&h.state, &id, now);
        assert_eq!(outcome.status, SessionStatus::Blocked);
        assert_eq!(outcome.violation_count, 5);
        assert!(outcome.should_block);

        let session = h.state.get_session(&id).expect("session");
        let review = session.pending_review().expect("pending review");
        assert_eq!(review.risk_score_snapshot, 100);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::ReviewRequested);
        assert_eq!(sent[0].recipient, "mentor-1");
        assert_eq!(sent[0].payload["risk_score"], 100);

        let status = h.state.review_status(&id).expect("review status");
        assert_eq!(status.review, ReviewState::Pending);
    }

    #[test]
    fn approval_resumes_without_resetting_score() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);
        block(&h.state, &id, now);

        let ack = h
            .state
            .decide_review(Some(&mentor()), decide(&id, Decision::Approve), now + Duration::seconds(20))
            .expect("approve");
        assert_eq!(ack.status, SessionStatus::Active);
        assert_eq!(ack.decision, ReviewDecision::Approved);

        let session = h.state.get_session(&id).expect("session");
        assert_eq!(session.risk_score, 100);
        assert_eq!(session.violation_count(), 5);
        let review = session.current_review().expect("review");
        assert_eq!(review.decided_by.as_deref(), Some("mentor-1"));

        // One more violation re-blocks and opens a second request.
        let outcome = h
            .state
            .record_violation(
                violation(&id, "devtools_open", Severity::High),
                now + Duration::seconds(25),
            )
            .expect("violation after resume");
        assert_eq!(outcome.status, SessionStatus::Blocked);
        let session = h.state.get_session(&id).expect("session");
        assert_eq!(session.reviews.len(), 2);
        assert_eq!(session.reviews[0].decision, ReviewDecision::Approved);
        assert!(session.reviews[1].is_pending());
    }

    #[test]
    fn end_while_blocked_is_a_noop() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);
        block(&h.state, &id, now);

        let ended = h
            .state
            .end_session(
                EndSessionParams {
                    session_id: id.clone(),
                    recordings: None,
                },
                now + Duration::seconds(30),
            )
            .expect("end");
        assert_eq!(ended.status, SessionStatus::Blocked);
        assert_eq!(h.state.get_session(&id).expect("session").status, SessionStatus::Blocked);
    }

    #[test]
    fn same_type_inside_cooldown_is_dropped() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);

        let first = h
            .state
            .record_violation(violation(&id, "tab_switch", Severity::Medium), now)
            .expect("first");
        let second = h
            .state
            .record_violation(
                violation(&id, "tab_switch", Severity::Medium),
                now + Duration::seconds(1),
            )
            .expect("second");
        assert!(first.accepted);
        assert!(!second.accepted);
        assert_eq!(second.violation_count, 1);
        assert_eq!(second.risk_score, first.risk_score);

        let third = h
            .state
            .record_violation(
                violation(&id, "tab_switch", Severity::Medium),
                now + Duration::seconds(31),
            )
            .expect("third");
        assert!(third.accepted);
        assert_eq!(third.violation_count, 2);
        assert_eq!(
            h.db.load_session(&id).expect("load").expect("row").violation_count(),
            2
        );
    }

    #[test]
    fn rejection_terminates_and_freezes_session() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);
        block(&h.state, &id, now);
        let mut viewer = h.state.relay().subscribe(&id, "mentor-1");

        let ack = h
            .state
            .decide_review(Some(&mentor()), decide(&id, Decision::Reject), now + Duration::seconds(20))
            .expect("reject");
        assert_eq!(ack.status, SessionStatus::Terminated);
        assert_eq!(ack.decision, ReviewDecision::Rejected);

        let kinds: Vec<NotificationKind> = h.notifier.sent().iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::ReviewRequested, NotificationKind::SessionTerminated]
        );
        assert_eq!(viewer.next(), Some(RelayEvent::NoSignal));
        assert!(matches!(viewer.next(), Some(RelayEvent::Ended { .. })));

        let outcome = h
            .state
            .record_violation(
                violation(&id, "devtools_open", Severity::Critical),
                now + Duration::seconds(60),
            )
            .expect("violation on terminal session");
        assert!(!outcome.accepted);
        assert_eq!(outcome.violation_count, 5);
        assert_eq!(outcome.status, SessionStatus::Terminated);

        let again = h
            .state
            .decide_review(Some(&mentor()), decide(&id, Decision::Approve), now + Duration::seconds(61))
            .expect_err("second decision");
        assert_eq!(again.code(), "review_already_decided");
        assert!(h.state.active_sessions(now).is_empty());
    }

    #[test]
    fn decisions_require_reviewer_and_pending_request() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);

        let err = h
            .state
            .decide_review(Some(&candidate()), decide(&id, Decision::Approve), now)
            .expect_err("candidate cannot decide");
        assert_eq!(err.code(), "unauthorized");
        let err = h
            .state
            .decide_review(None, decide(&id, Decision::Approve), now)
            .expect_err("anonymous cannot decide");
        assert_eq!(err.code(), "unauthorized");

        let err = h
            .state
            .decide_review(Some(&mentor()), decide(&id, Decision::Approve), now)
            .expect_err("nothing to decide");
        assert_eq!(err.code(), "review_not_pending");
        assert_eq!(
            h.state.review_status(&id).expect("status").review,
            ReviewState::None
        );
    }

    #[test]
    fn explicit_review_request_is_idempotent_and_needs_block() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);
        let params = || RequestReviewParams {
            session_id: id.clone(),
            reason: "candidate asked for help".to_string(),
            violations: None,
            risk_score: None,
        };

        let err = h.state.request_review(params(), now).expect_err("active session");
        assert_eq!(err.code(), "invalid_state");

        block(&h.state, &id, now);
        let ack = h.state.request_review(params(), now).expect("pending already");
        assert!(!ack.created);
        let session = h.state.get_session(&id).expect("session");
        assert_eq!(session.reviews.len(), 1);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[test]
    fn start_session_checks_identity_and_exam() {
        let h = harness_with({
            let mut config = test_config();
            config.defaults.allow_unlisted_exams = false;
            config
        });
        let now = Utc::now();
        let params = |exam_id: &str| StartSessionParams {
            exam_id: exam_id.to_string(),
            environment_check: None,
        };

        let err = h
            .state
            .start_session(None, params("exam-1"), now)
            .expect_err("missing identity");
        assert_eq!(err.code(), ERROR_MISSING_FIELD);
        let err = h
            .state
            .start_session(Some(&mentor()), params("exam-1"), now)
            .expect_err("mentor is not a candidate");
        assert_eq!(err.code(), "unauthorized");
        let err = h
            .state
            .start_session(Some(&candidate()), params("exam-off"), now)
            .expect_err("proctoring disabled");
        assert_eq!(err.code(), "proctoring_disabled");
        let err = h
            .state
            .start_session(Some(&candidate()), params("unlisted"), now)
            .expect_err("unlisted exam");
        assert_eq!(err.code(), "exam_not_found");

        let started = h
            .state
            .start_session(Some(&candidate()), params("exam-1"), now)
            .expect("start");
        assert_eq!(started.status, SessionStatus::Active);
        let session = h.state.get_session(&started.session_id).expect("session");
        assert_eq!(session.candidate_id, "cand-1");
        assert_eq!(session.environment_check, json!({}));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let h = harness();
        let err = h
            .state
            .record_violation(violation("missing", "tab_switch", Severity::Low), Utc::now())
            .expect_err("unknown session");
        assert_eq!(err.code(), "session_not_found");
        assert_eq!(
            h.state.review_status("missing").expect_err("unknown").code(),
            "session_not_found"
        );
    }

    #[test]
    fn concurrent_violations_block_exactly_once() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);
        let state = Arc::new(h.state);

        let workers: Vec<_> = (0..8)
            .map(|index| {
                let state = Arc::clone(&state);
                let id = id.clone();
                std::thread::spawn(move || {
                    state
                        .record_violation(
                            violation(&id, &format!("signal_{}", index), Severity::Low),
                            now,
                        )
                        .expect("record")
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }

        let session = state.get_session(&id).expect("session");
        assert_eq!(session.violation_count(), 8);
        assert_eq!(session.status, SessionStatus::Blocked);
        assert_eq!(session.reviews.len(), 1);
        let seqs: Vec<u32> = session.violations.iter().map(|v| v.seq).collect();
        assert_eq!(seqs, (1..=8).collect::<Vec<u32>>());

        let stored = h.db.load_session(&id).expect("load").expect("row");
        assert_eq!(stored.violation_count(), 8);
        assert_eq!(stored.status, SessionStatus::Blocked);
    }

    #[test]
    fn restart_recovers_live_sessions_from_storage() {
        let h = harness();
        let now = Utc::now();
        let blocked = start(&h.state, now);
        block(&h.state, &blocked, now);
        let finished = start(&h.state, now);
        h.state
            .end_session(
                EndSessionParams {
                    session_id: finished.clone(),
                    recordings: Some(json!({"video": "s3://bucket/rec.webm"})),
                },
                now,
            )
            .expect("end");

        let restarted = SharedState::new(h.db.clone(), test_config());
        assert_eq!(restarted.recover().expect("recover"), 1);

        let active = restarted.active_sessions(now + Duration::seconds(60));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, blocked);
        assert_eq!(active[0].status, SessionStatus::Blocked);
        assert_eq!(active[0].violation_count, 5);

        let recovered = restarted.get_session(&blocked).expect("recovered");
        assert!(recovered.pending_review().is_some());

        // Terminal sessions stay readable from storage.
        let done = restarted.get_session(&finished).expect("finished");
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.recordings, Some(json!({"video": "s3://bucket/rec.webm"})));

        let ack = restarted
            .decide_review(Some(&mentor()), decide(&blocked, Decision::Approve), now)
            .expect("decide after restart");
        assert_eq!(ack.status, SessionStatus::Active);
    }

    #[test]
    fn terminate_exam_reaches_producer_and_closes_session() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);
        let link = h.state.relay().attach_producer(&id);

        let err = h
            .state
            .terminate_exam(
                Some(&candidate()),
                TerminateExamParams {
                    session_id: id.clone(),
                    reason: "phone visible".to_string(),
                },
                now,
            )
            .expect_err("candidates cannot terminate");
        assert_eq!(err.code(), "unauthorized");

        let ack = h
            .state
            .terminate_exam(
                Some(&mentor()),
                TerminateExamParams {
                    session_id: id.clone(),
                    reason: "phone visible".to_string(),
                },
                now,
            )
            .expect("terminate");
        assert!(ack.delivered);
        assert_eq!(ack.status, SessionStatus::Terminated);
        assert_eq!(
            link.next_control(),
            Some(ControlMessage::TerminateExam {
                reason: "phone visible".to_string()
            })
        );
        assert_eq!(h.state.health().streams, 0);
    }

    #[test]
    fn terminate_exam_on_blocked_session_rejects_pending_review() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);
        block(&h.state, &id, now);

        let ack = h
            .state
            .terminate_exam(
                Some(&mentor()),
                TerminateExamParams {
                    session_id: id.clone(),
                    reason: "second person".to_string(),
                },
                now,
            )
            .expect("terminate");
        assert!(!ack.delivered);
        assert_eq!(ack.status, SessionStatus::Terminated);

        let session = h.state.get_session(&id).expect("session");
        let review = session.current_review().expect("review");
        assert_eq!(review.decision, ReviewDecision::Rejected);
        assert_eq!(review.decided_by.as_deref(), Some("mentor-1"));
        assert_eq!(review.comments.as_deref(), Some("second person"));
    }

    #[test]
    fn completing_ends_relay_and_keeps_recordings() {
        let h = harness();
        let now = Utc::now();
        let id = start(&h.state, now);
        h.state.ensure_streamable(&id, "publish_stream").expect("streamable");
        h.state.relay().publish_frame(&id, vec![1, 2], now.to_rfc3339());
        let mut viewer = h.state.relay().subscribe(&id, "mentor-1");

        let ended = h
            .state
            .end_session(
                EndSessionParams {
                    session_id: id.clone(),
                    recordings: Some(json!({"video": "rec-1"})),
                },
                now,
            )
            .expect("end");
        assert_eq!(ended.status, SessionStatus::Completed);
        assert!(matches!(viewer.next(), Some(RelayEvent::Frame(_))));
        assert_eq!(
            viewer.next(),
            Some(RelayEvent::Ended {
                reason: END_REASON_SESSION_CLOSED.to_string()
            })
        );

        let err = h
            .state
            .ensure_streamable(&id, "publish_stream")
            .expect_err("completed");
        assert_eq!(err.code(), "invalid_state");
    }

    #[test]
    fn sweep_prunes_cooldowns_and_releases_terminal_sessions() {
        let h = harness();
        let now = Utc::now();
        let live = start(&h.state, now);
        let done = start(&h.state, now);
        h.state
            .record_violation(violation(&live, "tab_switch", Severity::Low), now)
            .expect("violation");
        h.state
            .end_session(
                EndSessionParams {
                    session_id: done.clone(),
                    recordings: None,
                },
                now,
            )
            .expect("end");

        let report = h.state.sweep(now + Duration::seconds(400));
        assert_eq!(report.visited, 2);
        assert_eq!(report.pruned_cooldowns, 1);
        assert_eq!(report.released, 1);
        assert_eq!(report.idle, 1);
        assert_eq!(h.state.health().cached_sessions, 1);
        assert_eq!(h.state.health().sessions, 1);

        // Released sessions are reloaded on demand.
        assert_eq!(
            h.state.get_session(&done).expect("done").status,
            SessionStatus::Completed
        );
    }

    #[test]
    fn sweep_closes_channels_left_behind_by_finished_sessions() {
        let h = harness();
        let now = Utc::now();
        let live = start(&h.state, now);
        let done = start(&h.state, now);
        h.state
            .end_session(
                EndSessionParams {
                    session_id: done.clone(),
                    recordings: None,
                },
                now,
            )
            .expect("end");

        // Subscriptions that slipped in after the session closed.
        let mut late = h.state.relay().subscribe(&done, "mentor-1");
        let mut stray = h.state.relay().subscribe("s-unknown", "mentor-1");
        let mut watching = h.state.relay().subscribe(&live, "mentor-1");
        assert_eq!(h.state.relay().channel_count(), 3);

        let report = h.state.sweep(now);
        assert_eq!(report.closed_streams, 2);
        assert_eq!(h.state.relay().session_ids(), vec![live.clone()]);

        for subscription in [&mut late, &mut stray] {
            assert_eq!(subscription.next(), Some(RelayEvent::NoSignal));
            assert_eq!(
                subscription.next(),
                Some(RelayEvent::Ended {
                    reason: END_REASON_SESSION_CLOSED.to_string()
                })
            );
        }
        assert_eq!(watching.next(), Some(RelayEvent::NoSignal));
        assert_eq!(
            watching.recv_timeout(std::time::Duration::from_millis(10)),
            Ok(None)
        );
    }
}
