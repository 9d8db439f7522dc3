//! Video relay clients: `publish` (candidate) and `watch` (mentor).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use proctor_protocol::{Method, RelayMessage};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::daemon_client::{AgentError, DaemonClient, RelayReader, StreamConnection};

const FRAME_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "bmp"];
const WAIT_SLICE_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishExit {
    /// Every frame was sent and the stream was left.
    Finished { frames: u64 },
    /// A mentor ended the exam.
    Terminated { reason: String },
    /// The daemon closed the connection.
    Disconnected,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub interval: Duration,
    /// Cycle through the frames until stopped instead of sending each once.
    pub repeat: bool,
}

/// Image files in `dir`, in name order.
pub fn collect_frames(dir: &Path) -> Result<Vec<PathBuf>, AgentError> {
    let entries = fs_err::read_dir(dir).map_err(|err| AgentError::FrameSource(err.to_string()))?;
    let mut frames: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    frames.sort();
    if frames.is_empty() {
        return Err(AgentError::FrameSource(format!(
            "no image files in {}",
            dir.display()
        )));
    }
    Ok(frames)
}

#[derive(Default)]
struct ControlState {
    terminated: Mutex<Option<String>>,
    closed: AtomicBool,
}

pub fn publish(
    client: &DaemonClient,
    session_id: &str,
    frames: &[PathBuf],
    options: &PublishOptions,
    cancel: Arc<AtomicBool>,
) -> Result<PublishExit, AgentError> {
    let StreamConnection { writer, reader, .. } =
        client.open_stream(Method::PublishStream, json!({ "session_id": session_id }))?;
    let mut connection = writer;
    let control = Arc::new(ControlState::default());
    spawn_control_reader(reader, Arc::clone(&control), session_id.to_string());
    info!(session_id, frames = frames.len(), "Publishing frames");

    let mut seq = 0u64;
    loop {
        for path in frames {
            if let Some(exit) = stop_reason(&control, &cancel) {
                return Ok(exit);
            }
            let bytes = match fs_err::read(path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(session_id, error = %err, "Skipping unreadable frame");
                    continue;
                }
            };
            seq += 1;
            let frame = RelayMessage::Frame {
                session_id: session_id.to_string(),
                data: STANDARD.encode(&bytes),
                timestamp: Utc::now().to_rfc3339(),
                seq,
            };
            if let Err(err) = send_line(&mut connection, &frame) {
                warn!(session_id, error = %err, "Frame send failed");
                return Ok(stop_reason(&control, &cancel).unwrap_or(PublishExit::Disconnected));
            }
            if let Some(exit) = pause(options.interval, &control, &cancel) {
                return Ok(exit);
            }
        }
        if !options.repeat {
            break;
        }
    }

    let _ = send_line(&mut connection, &RelayMessage::Leave {});
    info!(session_id, frames = seq, "Publishing finished");
    Ok(PublishExit::Finished { frames: seq })
}

fn send_line(stream: &mut std::os::unix::net::UnixStream, message: &RelayMessage) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    stream.write_all(&payload)
}

fn spawn_control_reader(mut reader: RelayReader, control: Arc<ControlState>, session_id: String) {
    thread::spawn(move || {
        loop {
            match reader.next_message() {
                Ok(Some(RelayMessage::TerminateExam { reason, .. })) => {
                    warn!(session_id = %session_id, reason = %reason, "Exam terminated by mentor");
                    match control.terminated.lock() {
                        Ok(mut slot) => *slot = Some(reason),
                        Err(poisoned) => *poisoned.into_inner() = Some(reason),
                    }
                    return;
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "Relay control read failed");
                    break;
                }
            }
        }
        control.closed.store(true, Ordering::SeqCst);
    });
}

fn stop_reason(control: &ControlState, cancel: &AtomicBool) -> Option<PublishExit> {
    let terminated = match control.terminated.lock() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    if let Some(reason) = terminated {
        return Some(PublishExit::Terminated { reason });
    }
    if cancel.load(Ordering::SeqCst) {
        return Some(PublishExit::Cancelled);
    }
    if control.closed.load(Ordering::SeqCst) {
        return Some(PublishExit::Disconnected);
    }
    None
}

fn pause(interval: Duration, control: &ControlState, cancel: &AtomicBool) -> Option<PublishExit> {
    let deadline = Instant::now() + interval;
    loop {
        if let Some(exit) = stop_reason(control, cancel) {
            return Some(exit);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        thread::sleep(remaining.min(Duration::from_millis(WAIT_SLICE_MS)));
    }
}

/// Prints one line per relay event until the stream ends.
pub fn watch<W: Write>(
    client: &DaemonClient,
    session_id: &str,
    viewer_id: Option<&str>,
    out: &mut W,
) -> Result<String, AgentError> {
    let mut params = json!({ "session_id": session_id });
    if let Some(viewer_id) = viewer_id {
        params["viewer_id"] = json!(viewer_id);
    }
    let mut connection = client.open_stream(Method::JoinStream, params)?;
    info!(session_id, viewer_id = ?connection.ack.get("viewer_id"), "Watching relay");
    let print = |out: &mut W, line: String| {
        writeln!(out, "{}", line).map_err(|err| AgentError::Transport(err.to_string()))
    };

    loop {
        match connection.next_message()? {
            Some(RelayMessage::Frame {
                seq, data, timestamp, ..
            }) => {
                let line = match STANDARD.decode(&data) {
                    Ok(bytes) => format!("frame seq={} bytes={} at {}", seq, bytes.len(), timestamp),
                    Err(_) => format!("frame seq={} undecodable", seq),
                };
                print(out, line)?;
            }
            Some(RelayMessage::NoSignal { .. }) => print(out, "NO SIGNAL".to_string())?,
            Some(RelayMessage::StreamEnded { reason, .. }) => {
                print(out, format!("stream ended: {}", reason))?;
                return Ok(reason);
            }
            Some(_) => {}
            None => {
                print(out, "connection closed".to_string())?;
                return Ok("connection_closed".to_string());
            }
        }
    }
}
