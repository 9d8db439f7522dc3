//! Signal classification for the candidate client.
//!
//! Camera samples are smoothed over short streaks before they become
//! violation candidates; DOM events map straight through. Nothing here
//! deduplicates across time, the daemon's cooldown does that.

use chrono::{DateTime, Utc};
use proctor_protocol::{Severity, ViolationParams};
use serde::Deserialize;
use serde_json::json;

pub const NO_FACE_STREAK: u32 = 6;
pub const MULTI_FACE_STREAK: u32 = 2;
pub const BLOCKED_STREAK: u32 = 2;
pub const UNAVAILABLE_STREAK: u32 = 2;

const DARK_BRIGHTNESS: f64 = 20.0;
const FLAT_VARIANCE: f64 = 8.0;

/// Detector output for one camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameAnalysis {
    pub face_present: bool,
    #[serde(default)]
    pub face_count: u32,
    pub brightness: f64,
    pub variance: f64,
}

impl FrameAnalysis {
    fn is_dark_and_flat(&self) -> bool {
        self.brightness < DARK_BRIGHTNESS && self.variance < FLAT_VARIANCE
    }

    fn faces(&self) -> u32 {
        if self.face_present {
            self.face_count.max(1)
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Frame(FrameAnalysis),
    CameraUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomEvent {
    VisibilityHidden,
    WindowBlur,
    ContextMenu,
    CopyPaste,
    FullscreenExit,
    DevtoolsOpen,
    ScreenShareStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CameraState {
    Unavailable,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLine {
    Dom { event: DomEvent },
    Camera { camera: CameraState },
    Frame(FrameAnalysis),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputLine {
    Sample(Sample),
    Dom(DomEvent),
}

pub fn parse_input_line(line: &str) -> Result<InputLine, String> {
    match serde_json::from_str::<RawLine>(line) {
        Ok(RawLine::Dom { event }) => Ok(InputLine::Dom(event)),
        Ok(RawLine::Camera { .. }) => Ok(InputLine::Sample(Sample::CameraUnavailable)),
        Ok(RawLine::Frame(analysis)) => Ok(InputLine::Sample(Sample::Frame(analysis))),
        Err(err) => Err(format!("Unrecognized input line: {}", err)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Frame,
    Dom,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Frame => "frame",
            SignalSource::Dom => "dom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationCandidate {
    pub violation_type: &'static str,
    pub severity: Severity,
    pub description: String,
    pub source: SignalSource,
}

impl ViolationCandidate {
    fn frame(violation_type: &'static str, severity: Severity, description: String) -> Self {
        Self {
            violation_type,
            severity,
            description,
            source: SignalSource::Frame,
        }
    }

    pub fn into_params(self, session_id: &str, now: DateTime<Utc>) -> ViolationParams {
        ViolationParams {
            session_id: session_id.to_string(),
            violation_type: self.violation_type.to_string(),
            severity: self.severity,
            description: Some(self.description),
            metadata: Some(json!({
                "timestamp": now.to_rfc3339(),
                "user_agent": user_agent(),
                "source": self.source.as_str(),
            })),
        }
    }
}

pub fn user_agent() -> String {
    format!("proctor-agent/{}", env!("CARGO_PKG_VERSION"))
}

pub fn classify_dom_event(event: DomEvent) -> ViolationCandidate {
    let (violation_type, severity, description) = match event {
        DomEvent::VisibilityHidden => ("tab_switch", Severity::Medium, "Exam tab was hidden"),
        DomEvent::WindowBlur => ("window_blur", Severity::Low, "Exam window lost focus"),
        DomEvent::ContextMenu => ("right_click", Severity::Low, "Context menu opened"),
        DomEvent::CopyPaste => ("copy_paste", Severity::Medium, "Clipboard used during exam"),
        DomEvent::FullscreenExit => ("fullscreen_exit", Severity::Medium, "Left fullscreen mode"),
        DomEvent::DevtoolsOpen => ("devtools_open", Severity::High, "Developer tools opened"),
        DomEvent::ScreenShareStopped => (
            "screen_share_stopped",
            Severity::High,
            "Screen sharing stopped",
        ),
    };
    ViolationCandidate {
        violation_type,
        severity,
        description: description.to_string(),
        source: SignalSource::Dom,
    }
}

/// Consecutive-sample counters. A streak fires once when it reaches its
/// threshold and then starts counting again from zero.
#[derive(Debug, Default, Clone)]
pub struct SignalDetector {
    no_face: u32,
    multi_face: u32,
    blocked: u32,
    unavailable: u32,
}

impl SignalDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn observe(&mut self, sample: &Sample) -> Vec<ViolationCandidate> {
        let mut candidates = Vec::new();
        let analysis = match sample {
            Sample::CameraUnavailable => {
                self.no_face = 0;
                self.multi_face = 0;
                self.blocked = 0;
                if bump(&mut self.unavailable, UNAVAILABLE_STREAK) {
                    candidates.push(ViolationCandidate::frame(
                        "camera_disabled",
                        Severity::Critical,
                        "Camera is unavailable".to_string(),
                    ));
                }
                return candidates;
            }
            Sample::Frame(analysis) => analysis,
        };
        self.unavailable = 0;

        // A covered lens reads as an empty room; report it as blocked only.
        if analysis.is_dark_and_flat() {
            self.no_face = 0;
            self.multi_face = 0;
            if bump(&mut self.blocked, BLOCKED_STREAK) {
                candidates.push(ViolationCandidate::frame(
                    "camera_blocked",
                    Severity::High,
                    format!(
                        "Camera view is dark and uniform (brightness {:.1}, variance {:.1})",
                        analysis.brightness, analysis.variance
                    ),
                ));
            }
            return candidates;
        }
        self.blocked = 0;

        match analysis.faces() {
            0 => {
                self.multi_face = 0;
                if bump(&mut self.no_face, NO_FACE_STREAK) {
                    candidates.push(ViolationCandidate::frame(
                        "no_face_detected",
                        Severity::High,
                        format!("No face detected for {} consecutive samples", NO_FACE_STREAK),
                    ));
                }
            }
            1 => {
                self.no_face = 0;
                self.multi_face = 0;
            }
            count => {
                self.no_face = 0;
                if bump(&mut self.multi_face, MULTI_FACE_STREAK) {
                    candidates.push(ViolationCandidate::frame(
                        "multiple_faces",
                        Severity::Critical,
                        format!("{} faces detected in frame", count),
                    ));
                }
            }
        }
        candidates
    }
}

fn bump(counter: &mut u32, threshold: u32) -> bool {
    *counter += 1;
    if *counter >= threshold {
        *counter = 0;
        true
    } else {
        false
    }
}
