//! Best-effort video relay.
//!
//! One producer and any number of viewers per session. Publishing never
//! blocks: each viewer has a small bounded queue and frames that do not fit
//! are dropped for that viewer only. The channel keeps the latest frame in a
//! single slot so a late viewer starts from the current picture, not a
//! backlog.
//!
//! Dropping every sender of a viewer's queue is itself an end-of-stream
//! signal, so teardown reaches viewers even when their queue is full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info};

const CONTROL_BUFFER: usize = 4;

pub const END_REASON_PRODUCER_LEFT: &str = "producer_left";
pub const END_REASON_PRODUCER_DISCONNECTED: &str = "producer_disconnected";
pub const END_REASON_SESSION_CLOSED: &str = "session_closed";
const END_REASON_CHANNEL_CLOSED: &str = "channel_closed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub session_id: String,
    pub seq: u64,
    pub data: Vec<u8>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Frame(Arc<VideoFrame>),
    /// The channel exists but has no picture yet.
    NoSignal,
    Ended { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    TerminateExam { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReport {
    pub seq: u64,
    pub delivered: usize,
    pub dropped: usize,
}

struct Viewer {
    viewer_id: String,
    tx: SyncSender<RelayEvent>,
}

struct ProducerSlot {
    token: u64,
    control: SyncSender<ControlMessage>,
}

struct StreamChannel {
    session_id: String,
    latest: Option<Arc<VideoFrame>>,
    next_seq: u64,
    viewers: HashMap<u64, Viewer>,
    producer: Option<ProducerSlot>,
}

impl StreamChannel {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            latest: None,
            next_seq: 1,
            viewers: HashMap::new(),
            producer: None,
        }
    }
}

type ChannelHandle = Arc<Mutex<StreamChannel>>;

pub struct VideoRelay {
    channels: Mutex<HashMap<String, ChannelHandle>>,
    next_id: AtomicU64,
    viewer_buffer: usize,
    frames_dropped: AtomicU64,
}

impl VideoRelay {
    pub fn new(viewer_buffer: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            viewer_buffer: viewer_buffer.max(1),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Registers the candidate's connection as the channel's producer. A
    /// second producer for the same session displaces the first.
    pub fn attach_producer(&self, session_id: &str) -> ProducerLink {
        let channel = self.channel_or_create(session_id);
        let token = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::sync_channel(CONTROL_BUFFER);
        if let Ok(mut channel) = channel.lock() {
            if channel.producer.is_some() {
                info!(session_id = %session_id, "Replacing existing relay producer");
            }
            channel.producer = Some(ProducerSlot {
                token,
                control: control_tx,
            });
        }
        info!(session_id = %session_id, token, "Relay producer attached");
        ProducerLink {
            session_id: session_id.to_string(),
            token,
            control: control_rx,
        }
    }

    #[cfg(test)]
    pub fn publish_frame(&self, session_id: &str, data: Vec<u8>, timestamp: String) -> PublishReport {
        let channel = self.channel_or_create(session_id);
        let report = match channel.lock() {
            Ok(mut channel) => self.broadcast(&mut channel, data, timestamp),
            Err(_) => PublishReport::default(),
        };
        report
    }

    /// Publishes on behalf of an attached producer. `None` once that producer
    /// no longer owns the channel (displaced, left, or session closed).
    pub fn publish_from(
        &self,
        session_id: &str,
        token: u64,
        data: Vec<u8>,
        timestamp: String,
    ) -> Option<PublishReport> {
        let channel = self.channel(session_id)?;
        let mut channel = channel.lock().ok()?;
        let owns = matches!(&channel.producer, Some(producer) if producer.token == token);
        if !owns {
            return None;
        }
        Some(self.broadcast(&mut channel, data, timestamp))
    }

    fn broadcast(&self, channel: &mut StreamChannel, data: Vec<u8>, timestamp: String) -> PublishReport {
        let seq = channel.next_seq;
        channel.next_seq += 1;
        let frame = Arc::new(VideoFrame {
            session_id: channel.session_id.clone(),
            seq,
            data,
            timestamp,
        });
        channel.latest = Some(Arc::clone(&frame));

        let mut report = PublishReport {
            seq,
            ..PublishReport::default()
        };
        let mut gone = Vec::new();
        for (id, viewer) in channel.viewers.iter() {
            match viewer.tx.try_send(RelayEvent::Frame(Arc::clone(&frame))) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.dropped += 1,
                Err(TrySendError::Disconnected(_)) => gone.push(*id),
            }
        }
        for id in gone {
            if let Some(viewer) = channel.viewers.remove(&id) {
                debug!(session_id = %channel.session_id, viewer_id = %viewer.viewer_id, "Relay viewer gone");
            }
        }
        if report.dropped > 0 {
            self.frames_dropped
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            debug!(session_id = %channel.session_id, seq, dropped = report.dropped, "Relay frames dropped");
        }
        report
    }

    /// Joins a session's stream. The first event is the current frame, or
    /// `NoSignal` if there is none yet.
    pub fn subscribe(&self, session_id: &str, viewer_id: &str) -> Subscription {
        let channel = self.channel_or_create(session_id);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(self.viewer_buffer);

        if let Ok(mut guard) = channel.lock() {
            let first = match &guard.latest {
                Some(frame) => RelayEvent::Frame(Arc::clone(frame)),
                None => RelayEvent::NoSignal,
            };
            let _ = tx.try_send(first);
            guard.viewers.insert(
                id,
                Viewer {
                    viewer_id: viewer_id.to_string(),
                    tx,
                },
            );
            info!(
                session_id = %session_id,
                viewer_id = %viewer_id,
                viewers = guard.viewers.len(),
                "Relay viewer joined"
            );
        }

        Subscription {
            id,
            session_id: session_id.to_string(),
            rx,
            channel: Arc::downgrade(&channel),
            finished: false,
        }
    }

    /// Tears the channel down and tells every viewer the stream ended.
    pub fn end_stream(&self, session_id: &str, reason: &str) -> bool {
        let channel = match self.channels.lock() {
            Ok(mut channels) => channels.remove(session_id),
            Err(_) => None,
        };
        let Some(channel) = channel else {
            return false;
        };

        if let Ok(mut channel) = channel.lock() {
            for (_, viewer) in channel.viewers.drain() {
                let _ = viewer.tx.try_send(RelayEvent::Ended {
                    reason: reason.to_string(),
                });
            }
            channel.producer = None;
            channel.latest = None;
            info!(session_id = %channel.session_id, reason, "Relay stream ended");
        }
        true
    }

    /// Called when a producer's transport closes. Only the producer that
    /// currently owns the channel can tear it down.
    pub fn producer_gone(&self, session_id: &str, token: u64, reason: &str) -> bool {
        let channel = match self.channel(session_id) {
            Some(channel) => channel,
            None => return false,
        };
        let owns = channel
            .lock()
            .map(|channel| {
                channel
                    .producer
                    .as_ref()
                    .map(|producer| producer.token == token)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !owns {
            debug!(session_id = %session_id, token, "Stale relay producer detached");
            return false;
        }
        self.end_stream(session_id, reason)
    }

    /// Delivers a terminate instruction to the session's producer connection
    /// only. Returns whether a producer received it.
    pub fn terminate_exam(&self, session_id: &str, reason: &str) -> bool {
        let Some(channel) = self.channel(session_id) else {
            return false;
        };
        let Ok(channel) = channel.lock() else {
            return false;
        };
        match &channel.producer {
            Some(producer) => producer
                .control
                .try_send(ControlMessage::TerminateExam {
                    reason: reason.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .map(|channels| channels.len())
            .unwrap_or(0)
    }

    /// Sessions that currently have a channel, producer or viewers attached.
    pub fn session_ids(&self) -> Vec<String> {
        self.channels
            .lock()
            .map(|channels| channels.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn viewer_count(&self, session_id: &str) -> usize {
        self.channel(session_id)
            .and_then(|channel| channel.lock().ok().map(|channel| channel.viewers.len()))
            .unwrap_or(0)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    fn channel(&self, session_id: &str) -> Option<ChannelHandle> {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(session_id).cloned())
    }

    fn channel_or_create(&self, session_id: &str) -> ChannelHandle {
        match self.channels.lock() {
            Ok(mut channels) => Arc::clone(channels.entry(session_id.to_string()).or_insert_with(|| {
                debug!(session_id = %session_id, "Relay channel created");
                Arc::new(Mutex::new(StreamChannel::new(session_id)))
            })),
            // Detached channel: callers still work, nothing is shared.
            Err(_) => Arc::new(Mutex::new(StreamChannel::new(session_id))),
        }
    }
}

/// Producer side of a channel: carries the control messages addressed to
/// this candidate connection.
pub struct ProducerLink {
    pub session_id: String,
    token: u64,
    control: Receiver<ControlMessage>,
}

impl ProducerLink {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Waits for the next control message. `None` once the link was
    /// displaced or the channel was torn down.
    pub fn next_control(&self) -> Option<ControlMessage> {
        self.control.recv().ok()
    }

    #[cfg(test)]
    pub fn try_control(&self) -> Option<ControlMessage> {
        self.control.try_recv().ok()
    }
}

/// A viewer's lazy, non-restartable stream of relay events.
pub struct Subscription {
    id: u64,
    pub session_id: String,
    rx: Receiver<RelayEvent>,
    channel: Weak<Mutex<StreamChannel>>,
    finished: bool,
}

impl Subscription {
    /// Waits up to `timeout`. `Ok(None)` means nothing arrived in time.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<RelayEvent>, ()> {
        if self.finished {
            return Err(());
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(self.observe(event))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(Some(self.closed())),
        }
    }

    fn observe(&mut self, event: RelayEvent) -> RelayEvent {
        if matches!(event, RelayEvent::Ended { .. }) {
            self.finished = true;
        }
        event
    }

    fn closed(&mut self) -> RelayEvent {
        self.finished = true;
        RelayEvent::Ended {
            reason: END_REASON_CHANNEL_CLOSED.to_string(),
        }
    }
}

impl Iterator for Subscription {
    type Item = RelayEvent;

    fn next(&mut self) -> Option<RelayEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(event) => Some(self.observe(event)),
            Err(_) => Some(self.closed()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            if let Ok(mut channel) = channel.lock() {
                if channel.viewers.remove(&self.id).is_some() {
                    debug!(session_id = %self.session_id, "Relay viewer left");
                }
            }
        }
    }
}
