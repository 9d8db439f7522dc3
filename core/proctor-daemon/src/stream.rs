//! Streaming connections for the video relay.
//!
//! After the initial `ok` response a streaming connection stays open and
//! carries newline-delimited `RelayMessage` JSON. Viewers only receive.
//! Producers send frames, while a separate writer thread forwards control
//! messages addressed to the candidate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use proctor_protocol::{
    parse_params, parse_relay_line, JoinStreamParams, RelayMessage, Request, Response, SessionRef,
};
use serde::Serialize;
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::relay::{
    ControlMessage, ProducerLink, RelayEvent, END_REASON_PRODUCER_DISCONNECTED,
    END_REASON_PRODUCER_LEFT, END_REASON_SESSION_CLOSED,
};
use crate::error::ProctorError;
use crate::state::{authorize_reviewer, SharedState};

const VIEWER_WRITE_TIMEOUT_SECS: u64 = 2;
const LINE_OVERHEAD_BYTES: usize = 4096;

pub fn write_line<T: Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, value)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Mentor side: forwards relay events until the stream ends or the viewer
/// goes away.
pub fn serve_viewer(mut stream: UnixStream, state: &SharedState, request: Request) {
    let request_id = request.id.clone();
    let viewer = match authorize_reviewer(request.identity.as_ref(), "join_stream") {
        Ok(identity) => identity.clone(),
        Err(err) => {
            let _ = write_line(&mut stream, &Response::error_with_info(request_id, err.to_error_info()));
            return;
        }
    };
    let params: JoinStreamParams = match parse_params(request.params) {
        Ok(params) => params,
        Err(err) => {
            let _ = write_line(&mut stream, &Response::error_with_info(request_id, err));
            return;
        }
    };
    if let Err(err) = state.ensure_streamable(&params.session_id, "join_stream") {
        let _ = write_line(&mut stream, &Response::error_with_info(request_id, err.to_error_info()));
        return;
    }

    let session_id = params.session_id;
    let viewer_id = params.viewer_id.unwrap_or(viewer.user_id);
    let mut subscription = state.relay().subscribe(&session_id, &viewer_id);
    // The session may have closed between the check and the subscribe.
    if let Err(err) = state.ensure_streamable(&session_id, "join_stream") {
        drop(subscription);
        if matches!(err, ProctorError::InvalidState { .. } | ProctorError::SessionNotFound(_)) {
            state.relay().end_stream(&session_id, END_REASON_SESSION_CLOSED);
        }
        let _ = write_line(&mut stream, &Response::error_with_info(request_id, err.to_error_info()));
        return;
    }
    let ack = Response::ok(
        request_id,
        json!({ "session_id": session_id, "viewer_id": viewer_id }),
    );
    if write_line(&mut stream, &ack).is_err() {
        return;
    }

    let _ = stream.set_write_timeout(Some(Duration::from_secs(VIEWER_WRITE_TIMEOUT_SECS)));
    let heartbeat = Duration::from_secs(state.config().relay.viewer_heartbeat_secs.max(1));
    loop {
        let message = match subscription.recv_timeout(heartbeat) {
            Ok(Some(RelayEvent::Frame(frame))) => RelayMessage::Frame {
                session_id: frame.session_id.clone(),
                data: STANDARD.encode(&frame.data),
                timestamp: frame.timestamp.clone(),
                seq: frame.seq,
            },
            // No picture yet, or none within a heartbeat.
            Ok(Some(RelayEvent::NoSignal)) | Ok(None) => RelayMessage::NoSignal {
                session_id: session_id.clone(),
            },
            Ok(Some(RelayEvent::Ended { reason })) => {
                let ended = RelayMessage::StreamEnded {
                    session_id: session_id.clone(),
                    reason: reason.clone(),
                };
                let _ = write_line(&mut stream, &ended);
                info!(session_id = %session_id, viewer_id = %viewer_id, reason = %reason, "Viewer stream ended");
                return;
            }
            Err(()) => return,
        };

        if let Err(err) = write_line(&mut stream, &message) {
            debug!(session_id = %session_id, viewer_id = %viewer_id, error = %err, "Viewer disconnected");
            return;
        }
    }
}

/// Candidate side: reads frames until the producer leaves, its transport
/// drops, or it stops owning the channel.
pub fn serve_producer(mut stream: UnixStream, state: &SharedState, request: Request) {
    let request_id = request.id.clone();
    let params: SessionRef = match parse_params(request.params) {
        Ok(params) => params,
        Err(err) => {
            let _ = write_line(&mut stream, &Response::error_with_info(request_id, err));
            return;
        }
    };
    if let Err(err) = state.ensure_streamable(&params.session_id, "publish_stream") {
        let _ = write_line(&mut stream, &Response::error_with_info(request_id, err.to_error_info()));
        return;
    }
    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            let _ = write_line(
                &mut stream,
                &Response::error(request_id, "internal_error", format!("Failed to clone stream: {}", err)),
            );
            return;
        }
    };

    let session_id = params.session_id;
    let ack = Response::ok(request_id, json!({ "session_id": session_id, "accepted": true }));
    if write_line(&mut stream, &ack).is_err() {
        return;
    }

    let link = state.relay().attach_producer(&session_id);
    let token = link.token();
    spawn_control_writer(writer, link);

    let reason = pump_frames(stream, state, &session_id, token);
    if state.relay().producer_gone(&session_id, token, reason) {
        info!(session_id = %session_id, reason, "Relay producer detached");
    }
}

fn spawn_control_writer(mut writer: UnixStream, link: ProducerLink) {
    thread::spawn(move || {
        // Ends when the channel is torn down or this producer is displaced.
        while let Some(message) = link.next_control() {
            let ControlMessage::TerminateExam { reason } = message;
            let line = RelayMessage::TerminateExam {
                session_id: link.session_id.clone(),
                reason: reason.clone(),
            };
            match write_line(&mut writer, &line) {
                Ok(()) => info!(session_id = %link.session_id, reason = %reason, "Terminate instruction delivered"),
                Err(err) => {
                    warn!(session_id = %link.session_id, error = %err, "Failed to deliver terminate instruction");
                    break;
                }
            }
        }
    });
}

enum LineRead {
    Eof,
    Line,
    TooLong,
}

fn pump_frames(stream: UnixStream, state: &SharedState, session_id: &str, token: u64) -> &'static str {
    let relay_config = &state.config().relay;
    let idle = Duration::from_secs(relay_config.producer_idle_timeout_secs.max(1));
    let _ = stream.set_read_timeout(Some(idle));
    let limit = max_line_bytes(relay_config.max_frame_bytes);
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        match read_line_limited(&mut reader, limit, &mut line) {
            Ok(LineRead::Line) => {}
            Ok(LineRead::Eof) => return END_REASON_PRODUCER_DISCONNECTED,
            Ok(LineRead::TooLong) => {
                warn!(session_id = %session_id, limit, "Relay line exceeded limit; closing producer");
                return END_REASON_PRODUCER_DISCONNECTED;
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                warn!(session_id = %session_id, "Relay producer idle; closing");
                return END_REASON_PRODUCER_DISCONNECTED;
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Relay producer read failed");
                return END_REASON_PRODUCER_DISCONNECTED;
            }
        }

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let message = match parse_relay_line(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id = %session_id, code = %err.code, message = %err.message, "Dropped malformed relay line");
                continue;
            }
        };

        match message {
            RelayMessage::Frame {
                session_id: frame_session,
                data,
                timestamp,
                ..
            } => {
                if frame_session != session_id {
                    warn!(session_id = %session_id, frame_session = %frame_session, "Dropped frame for another session");
                    continue;
                }
                let Some(bytes) = decode_frame(&data, relay_config.max_frame_bytes, session_id) else {
                    continue;
                };
                match state.relay().publish_from(session_id, token, bytes, timestamp) {
                    Some(report) => debug!(
                        session_id = %session_id,
                        seq = report.seq,
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "Frame relayed"
                    ),
                    None => {
                        info!(session_id = %session_id, "Relay producer no longer owns channel");
                        return END_REASON_PRODUCER_DISCONNECTED;
                    }
                }
            }
            RelayMessage::Leave {} => return END_REASON_PRODUCER_LEFT,
            other => debug!(session_id = %session_id, message = ?other, "Ignored relay message from producer"),
        }
    }
}

fn read_line_limited<R: BufRead>(reader: &mut R, limit: usize, line: &mut Vec<u8>) -> std::io::Result<LineRead> {
    line.clear();
    let read = reader.by_ref().take(limit as u64 + 1).read_until(b'\n', line)?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if !line.ends_with(b"\n") && line.len() > limit {
        return Ok(LineRead::TooLong);
    }
    Ok(LineRead::Line)
}

fn max_line_bytes(max_frame_bytes: usize) -> usize {
    max_frame_bytes.div_ceil(3) * 4 + LINE_OVERHEAD_BYTES
}

/// A frame is relayed whole or not at all.
fn decode_frame(data: &str, max_frame_bytes: usize, session_id: &str) -> Option<Vec<u8>> {
    if data.len() / 4 * 3 > max_frame_bytes + 2 {
        warn!(session_id = %session_id, encoded_len = data.len(), "Dropped oversize frame");
        return None;
    }
    match STANDARD.decode(data) {
        Ok(bytes) if bytes.is_empty() => {
            warn!(session_id = %session_id, "Dropped empty frame");
            None
        }
        Ok(bytes) if bytes.len() > max_frame_bytes => {
            warn!(session_id = %session_id, len = bytes.len(), "Dropped oversize frame");
            None
        }
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "Dropped undecodable frame");
            None
        }
    }
}
