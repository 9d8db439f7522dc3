//! The candidate-side sampling loop behind `proctor-agent monitor`.
//!
//! A reader thread turns input lines into a latest-sample slot (camera) and
//! an event channel (DOM, end of input). The loop ticks at a fixed period
//! and consumes at most the newest sample per tick; a tick with no fresh
//! sample is skipped. DOM events are reported as they arrive.

use chrono::Utc;
use proctor_protocol::{
    ReviewState, ReviewStatusView, SessionEnded, SessionSettings, SessionStatus, ViolationOutcome,
    ViolationParams,
};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::daemon_client::{AgentError, DaemonClient};
use crate::signals::{
    classify_dom_event, parse_input_line, DomEvent, InputLine, Sample, SignalDetector,
    ViolationCandidate,
};

pub const REVIEW_POLL_SECS: u64 = 5;
const CANCEL_CHECK_MS: u64 = 100;

/// The daemon calls the sampling loop depends on.
pub trait ProctorApi {
    fn record_violation(&self, params: &ViolationParams) -> Result<ViolationOutcome, AgentError>;
    fn review_status(&self, session_id: &str) -> Result<ReviewStatusView, AgentError>;
    fn end_session(&self, session_id: &str) -> Result<SessionEnded, AgentError>;
}

impl ProctorApi for DaemonClient {
    fn record_violation(&self, params: &ViolationParams) -> Result<ViolationOutcome, AgentError> {
        DaemonClient::record_violation(self, params)
    }

    fn review_status(&self, session_id: &str) -> Result<ReviewStatusView, AgentError> {
        DaemonClient::review_status(self, session_id)
    }

    fn end_session(&self, session_id: &str) -> Result<SessionEnded, AgentError> {
        DaemonClient::end_session(self, session_id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub sample_period: Duration,
    pub review_poll_period: Duration,
}

impl MonitorOptions {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            sample_period: Duration::from_secs(settings.face_check_interval_secs.max(1)),
            review_poll_period: Duration::from_secs(REVIEW_POLL_SECS),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Input ended and `end_session` was called; carries the reported status.
    InputClosed(SessionStatus),
    /// A mentor rejected the review.
    Rejected,
    Terminated,
    Completed,
    Cancelled,
}

enum Feed {
    Dom(DomEvent),
    Eof,
}

enum Wake {
    Feed(Feed),
    Deadline,
    Cancelled,
}

enum Step {
    Continue,
    Exit(MonitorExit),
}

type LatestSample = Arc<Mutex<Option<Sample>>>;

pub struct Monitor<'a, A: ProctorApi> {
    api: &'a A,
    session_id: String,
    options: MonitorOptions,
    cancel: Arc<AtomicBool>,
    detector: SignalDetector,
}

impl<'a, A: ProctorApi> Monitor<'a, A> {
    pub fn new(api: &'a A, session_id: &str, options: MonitorOptions, cancel: Arc<AtomicBool>) -> Self {
        Self {
            api,
            session_id: session_id.to_string(),
            options,
            cancel,
            detector: SignalDetector::new(),
        }
    }

    pub fn run<R: BufRead + Send + 'static>(mut self, input: R) -> Result<MonitorExit, AgentError> {
        let latest: LatestSample = Arc::new(Mutex::new(None));
        let feed = spawn_reader(input, Arc::clone(&latest));
        info!(session_id = %self.session_id, period_ms = self.options.sample_period.as_millis() as u64, "Monitoring started");

        let mut next_tick = Instant::now() + self.options.sample_period;
        loop {
            match self.wait(&feed, next_tick) {
                Wake::Cancelled => return Ok(MonitorExit::Cancelled),
                Wake::Feed(Feed::Eof) => return self.finish(),
                Wake::Feed(Feed::Dom(event)) => {
                    if let Step::Exit(exit) = self.report(classify_dom_event(event), &feed, &latest)? {
                        return Ok(exit);
                    }
                    continue;
                }
                Wake::Deadline => {}
            }

            let now = Instant::now();
            next_tick += self.options.sample_period;
            if next_tick <= now {
                next_tick = now + self.options.sample_period;
            }

            let sample = take_latest(&latest);
            let Some(sample) = sample else {
                debug!(session_id = %self.session_id, "No fresh sample; skipping cycle");
                continue;
            };
            for candidate in self.detector.observe(&sample) {
                if let Step::Exit(exit) = self.report(candidate, &feed, &latest)? {
                    return Ok(exit);
                }
            }
        }
    }

    fn report(
        &mut self,
        candidate: ViolationCandidate,
        feed: &Receiver<Feed>,
        latest: &LatestSample,
    ) -> Result<Step, AgentError> {
        let violation_type = candidate.violation_type;
        let params = candidate.into_params(&self.session_id, Utc::now());
        let outcome = match self.api.record_violation(&params) {
            Ok(outcome) => outcome,
            Err(err @ AgentError::Daemon(_)) => return Err(err),
            Err(err) => {
                warn!(session_id = %self.session_id, violation_type, error = %err, "Failed to report violation");
                return Ok(Step::Continue);
            }
        };
        info!(
            session_id = %self.session_id,
            violation_type,
            accepted = outcome.accepted,
            status = outcome.status.as_str(),
            risk_score = outcome.risk_score,
            "Violation reported"
        );

        match outcome.status {
            SessionStatus::Blocked => self.await_review(feed, latest),
            SessionStatus::Terminated => Ok(Step::Exit(MonitorExit::Terminated)),
            SessionStatus::Completed => Ok(Step::Exit(MonitorExit::Completed)),
            SessionStatus::Active | SessionStatus::Flagged => Ok(Step::Continue),
        }
    }

    /// Sampling is suspended until a mentor decides.
    fn await_review(&mut self, feed: &Receiver<Feed>, latest: &LatestSample) -> Result<Step, AgentError> {
        info!(session_id = %self.session_id, "Session blocked; awaiting mentor review");
        let mut next_poll = Instant::now() + self.options.review_poll_period;
        loop {
            match self.wait(feed, next_poll) {
                Wake::Cancelled => return Ok(Step::Exit(MonitorExit::Cancelled)),
                Wake::Feed(Feed::Eof) => return self.finish().map(Step::Exit),
                Wake::Feed(Feed::Dom(event)) => {
                    debug!(session_id = %self.session_id, event = ?event, "Ignoring DOM event while blocked");
                    continue;
                }
                Wake::Deadline => {}
            }
            next_poll = Instant::now() + self.options.review_poll_period;

            let view = match self.api.review_status(&self.session_id) {
                Ok(view) => view,
                Err(err @ AgentError::Daemon(_)) => return Err(err),
                Err(err) => {
                    warn!(session_id = %self.session_id, error = %err, "Review status poll failed");
                    continue;
                }
            };
            match (view.status, view.review) {
                (_, ReviewState::Rejected) => {
                    info!(session_id = %self.session_id, "Review rejected; stopping");
                    return Ok(Step::Exit(MonitorExit::Rejected));
                }
                (SessionStatus::Terminated, _) => return Ok(Step::Exit(MonitorExit::Terminated)),
                (SessionStatus::Completed, _) => return Ok(Step::Exit(MonitorExit::Completed)),
                (SessionStatus::Active | SessionStatus::Flagged, _) => {
                    info!(session_id = %self.session_id, status = view.status.as_str(), "Review approved; resuming");
                    self.detector.reset();
                    take_latest(latest);
                    return Ok(Step::Continue);
                }
                (SessionStatus::Blocked, _) => {
                    debug!(session_id = %self.session_id, "Review still pending");
                }
            }
        }
    }

    fn finish(&self) -> Result<MonitorExit, AgentError> {
        let ended = self.api.end_session(&self.session_id)?;
        info!(
            session_id = %self.session_id,
            status = ended.status.as_str(),
            risk_score = ended.risk_score,
            violation_count = ended.violation_count,
            "Input closed; session ended"
        );
        Ok(MonitorExit::InputClosed(ended.status))
    }

    fn wait(&self, feed: &Receiver<Feed>, deadline: Instant) -> Wake {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Wake::Cancelled;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Wake::Deadline;
            }
            match feed.recv_timeout(remaining.min(Duration::from_millis(CANCEL_CHECK_MS))) {
                Ok(Feed::Dom(event)) => return Wake::Feed(Feed::Dom(event)),
                Err(RecvTimeoutError::Timeout) => continue,
                // A cancel raised alongside EOF wins; the session is left open.
                Ok(Feed::Eof) | Err(RecvTimeoutError::Disconnected) => {
                    if self.cancel.load(Ordering::SeqCst) {
                        return Wake::Cancelled;
                    }
                    return Wake::Feed(Feed::Eof);
                }
            }
        }
    }
}

fn take_latest(latest: &LatestSample) -> Option<Sample> {
    match latest.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn spawn_reader<R: BufRead + Send + 'static>(input: R, latest: LatestSample) -> Receiver<Feed> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "Input read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_input_line(&line) {
                Ok(InputLine::Sample(sample)) => match latest.lock() {
                    Ok(mut slot) => *slot = Some(sample),
                    Err(poisoned) => *poisoned.into_inner() = Some(sample),
                },
                Ok(InputLine::Dom(event)) => {
                    if tx.send(Feed::Dom(event)).is_err() {
                        return;
                    }
                }
                Err(err) => warn!(error = %err, "Skipping malformed input line"),
            }
        }
        let _ = tx.send(Feed::Eof);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_protocol::ErrorInfo;
    use std::collections::VecDeque;
    use std::io::{BufReader, Write};
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct FakeApi {
        recorded: Mutex<Vec<ViolationParams>>,
        outcomes: Mutex<VecDeque<SessionStatus>>,
        reviews: Mutex<VecDeque<(ReviewState, SessionStatus)>>,
        polls: Mutex<usize>,
        ended: Mutex<bool>,
    }

    impl FakeApi {
        fn with_outcomes(outcomes: &[SessionStatus]) -> Self {
            let api = Self::default();
            api.outcomes.lock().unwrap().extend(outcomes.iter().copied());
            api
        }

        fn recorded_types(&self) -> Vec<String> {
            self.recorded
                .lock()
                .unwrap()
                .iter()
                .map(|params| params.violation_type.clone())
                .collect()
        }
    }

    impl ProctorApi for FakeApi {
        fn record_violation(&self, params: &ViolationParams) -> Result<ViolationOutcome, AgentError> {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.push(params.clone());
            let status = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(SessionStatus::Active);
            Ok(ViolationOutcome {
                risk_score: 10,
                status,
                violation_count: recorded.len(),
                should_block: status == SessionStatus::Blocked,
                accepted: true,
            })
        }

        fn review_status(&self, session_id: &str) -> Result<ReviewStatusView, AgentError> {
            *self.polls.lock().unwrap() += 1;
            let (review, status) = self
                .reviews
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((ReviewState::Pending, SessionStatus::Blocked));
            Ok(ReviewStatusView {
                session_id: session_id.to_string(),
                review,
                status,
            })
        }

        fn end_session(&self, session_id: &str) -> Result<SessionEnded, AgentError> {
            if session_id.is_empty() {
                return Err(AgentError::Daemon(ErrorInfo::new("invalid_params", "empty")));
            }
            *self.ended.lock().unwrap() = true;
            Ok(SessionEnded {
                session_id: session_id.to_string(),
                status: SessionStatus::Completed,
                risk_score: 0,
                violation_count: self.recorded.lock().unwrap().len(),
            })
        }
    }

    fn options() -> MonitorOptions {
        MonitorOptions {
            sample_period: Duration::from_millis(20),
            review_poll_period: Duration::from_millis(10),
        }
    }

    fn input() -> (UnixStream, BufReader<UnixStream>) {
        let (writer, reader) = UnixStream::pair().unwrap();
        (writer, BufReader::new(reader))
    }

    fn send(writer: &mut UnixStream, line: &str) {
        writer.write_all(line.as_bytes()).unwrap();
        writer.write_all(b"\n").unwrap();
    }

    const NO_FACE: &str = r#"{"face_present":false,"face_count":0,"brightness":120,"variance":40}"#;
    const TWO_FACES: &str = r#"{"face_present":true,"face_count":2,"brightness":120,"variance":40}"#;

    #[test]
    fn dom_events_are_reported_and_eof_ends_the_session() {
        let api = FakeApi::default();
        let (mut writer, reader) = input();
        send(&mut writer, r#"{"event":"visibility_hidden"}"#);
        send(&mut writer, "garbage");
        send(&mut writer, r#"{"event":"copy_paste"}"#);
        drop(writer);

        let exit = Monitor::new(&api, "s-1", options(), Arc::new(AtomicBool::new(false)))
            .run(reader)
            .unwrap();

        assert_eq!(exit, MonitorExit::InputClosed(SessionStatus::Completed));
        assert_eq!(api.recorded_types(), vec!["tab_switch", "copy_paste"]);
        let metadata = api.recorded.lock().unwrap()[0].metadata.clone().unwrap();
        assert_eq!(metadata["source"], "dom");
        assert!(*api.ended.lock().unwrap());
    }

    #[test]
    fn each_tick_consumes_only_the_newest_sample() {
        let api = FakeApi::default();
        let (mut writer, reader) = input();
        let cancel = Arc::new(AtomicBool::new(false));

        let handle = {
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                // A burst between ticks counts once; a stale sample is never reused.
                send(&mut writer, TWO_FACES);
                send(&mut writer, TWO_FACES);
                send(&mut writer, TWO_FACES);
                thread::sleep(Duration::from_millis(150));
                cancel.store(true, Ordering::SeqCst);
                writer
            })
        };

        let exit = Monitor::new(&api, "s-1", options(), cancel).run(reader).unwrap();
        let writer = handle.join().unwrap();
        drop(writer);
        assert_eq!(exit, MonitorExit::Cancelled);
        assert!(api.recorded_types().is_empty());
    }

    #[test]
    fn cancel_wins_over_input_closing_at_the_same_time() {
        let api = FakeApi::default();
        let (mut writer, reader) = input();
        let cancel = Arc::new(AtomicBool::new(false));

        let handle = {
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                send(&mut writer, TWO_FACES);
                thread::sleep(Duration::from_millis(30));
                cancel.store(true, Ordering::SeqCst);
                drop(writer);
            })
        };

        let exit = Monitor::new(&api, "s-1", options(), cancel).run(reader).unwrap();
        handle.join().unwrap();
        assert_eq!(exit, MonitorExit::Cancelled);
        assert!(!*api.ended.lock().unwrap());
    }

    #[test]
    fn sustained_absence_is_reported_once_per_streak() {
        let api = FakeApi::default();
        let (mut writer, reader) = input();

        let handle = thread::spawn(move || {
            for _ in 0..6 {
                send(&mut writer, NO_FACE);
                thread::sleep(Duration::from_millis(45));
            }
            drop(writer);
        });

        let exit = Monitor::new(&api, "s-1", options(), Arc::new(AtomicBool::new(false)))
            .run(reader)
            .unwrap();
        handle.join().unwrap();
        assert_eq!(exit, MonitorExit::InputClosed(SessionStatus::Completed));
        assert_eq!(api.recorded_types(), vec!["no_face_detected"]);
    }

    #[test]
    fn blocked_session_polls_until_approved_then_resumes() {
        let api = FakeApi::with_outcomes(&[SessionStatus::Blocked]);
        api.reviews.lock().unwrap().extend([
            (ReviewState::Pending, SessionStatus::Blocked),
            (ReviewState::Approved, SessionStatus::Active),
        ]);
        let (mut writer, reader) = input();

        let handle = thread::spawn(move || {
            send(&mut writer, r#"{"event":"devtools_open"}"#);
            thread::sleep(Duration::from_millis(120));
            send(&mut writer, r#"{"event":"window_blur"}"#);
            thread::sleep(Duration::from_millis(30));
            drop(writer);
        });

        let exit = Monitor::new(&api, "s-1", options(), Arc::new(AtomicBool::new(false)))
            .run(reader)
            .unwrap();
        handle.join().unwrap();

        assert_eq!(exit, MonitorExit::InputClosed(SessionStatus::Completed));
        assert_eq!(api.recorded_types(), vec!["devtools_open", "window_blur"]);
        assert!(*api.polls.lock().unwrap() >= 2);
    }

    #[test]
    fn rejection_stops_without_ending_the_session() {
        let api = FakeApi::with_outcomes(&[SessionStatus::Blocked]);
        api.reviews
            .lock()
            .unwrap()
            .push_back((ReviewState::Rejected, SessionStatus::Terminated));
        let (mut writer, reader) = input();
        send(&mut writer, r#"{"event":"screen_share_stopped"}"#);

        let exit = Monitor::new(&api, "s-1", options(), Arc::new(AtomicBool::new(false)))
            .run(reader)
            .unwrap();
        drop(writer);

        assert_eq!(exit, MonitorExit::Rejected);
        assert!(!*api.ended.lock().unwrap());
    }

    #[test]
    fn terminated_outcome_stops_sampling() {
        let api = FakeApi::with_outcomes(&[SessionStatus::Terminated]);
        let (mut writer, reader) = input();
        send(&mut writer, r#"{"event":"window_blur"}"#);
        send(&mut writer, r#"{"event":"window_blur"}"#);

        let exit = Monitor::new(&api, "s-1", options(), Arc::new(AtomicBool::new(false)))
            .run(reader)
            .unwrap();
        drop(writer);

        assert_eq!(exit, MonitorExit::Terminated);
        assert_eq!(api.recorded_types(), vec!["window_blur"]);
    }
}
