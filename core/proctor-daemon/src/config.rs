//! Runtime configuration for the proctoring daemon.
//!
//! Loaded from `~/.proctor/daemon/proctor.toml` (or `PROCTOR_CONFIG`). Every
//! field is optional; a missing file yields the defaults below.

use proctor_protocol::{Severity, SessionSettings};
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".proctor/daemon/proctor.toml";
const CONFIG_ENV: &str = "PROCTOR_CONFIG";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProctorConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub defaults: SettingsDefaults,
    #[serde(default)]
    pub exams: Vec<ExamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_block_threshold")]
    pub block_threshold: usize,
    #[serde(default = "default_flag_threshold")]
    pub flag_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub weights: SeverityWeights,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            block_threshold: default_block_threshold(),
            flag_threshold: default_flag_threshold(),
            cooldown_secs: default_cooldown_secs(),
            weights: SeverityWeights::default(),
        }
    }
}

impl PolicyConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeverityWeights {
    #[serde(default = "default_weight_low")]
    pub low: u32,
    #[serde(default = "default_weight_medium")]
    pub medium: u32,
    #[serde(default = "default_weight_high")]
    pub high: u32,
    #[serde(default = "default_weight_critical")]
    pub critical: u32,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            low: default_weight_low(),
            medium: default_weight_medium(),
            high: default_weight_high(),
            critical: default_weight_critical(),
        }
    }
}

impl SeverityWeights {
    pub fn weight(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_max_stream_connections")]
    pub max_stream_connections: usize,
    #[serde(default = "default_producer_idle_timeout_secs")]
    pub producer_idle_timeout_secs: u64,
    #[serde(default = "default_viewer_heartbeat_secs")]
    pub viewer_heartbeat_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            max_frame_bytes: default_max_frame_bytes(),
            max_stream_connections: default_max_stream_connections(),
            producer_idle_timeout_secs: default_producer_idle_timeout_secs(),
            viewer_heartbeat_secs: default_viewer_heartbeat_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_inactivity_warn_secs")]
    pub inactivity_warn_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            sweep_interval_secs: default_sweep_interval_secs(),
            inactivity_warn_secs: default_inactivity_warn_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingsDefaults {
    #[serde(default = "default_true")]
    pub proctoring_enabled: bool,
    #[serde(default = "default_true")]
    pub camera_required: bool,
    #[serde(default)]
    pub microphone_required: bool,
    #[serde(default)]
    pub screen_share_required: bool,
    #[serde(default = "default_true")]
    pub fullscreen_required: bool,
    #[serde(default = "default_face_check_interval_secs")]
    pub face_check_interval_secs: u64,
    #[serde(default = "default_frame_interval_secs")]
    pub frame_interval_secs: u64,
    #[serde(default = "default_true")]
    pub allow_unlisted_exams: bool,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            proctoring_enabled: true,
            camera_required: true,
            microphone_required: false,
            screen_share_required: false,
            fullscreen_required: true,
            face_check_interval_secs: default_face_check_interval_secs(),
            frame_interval_secs: default_frame_interval_secs(),
            allow_unlisted_exams: true,
        }
    }
}

/// Per-exam metadata and setting overrides.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExamConfig {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub proctoring_enabled: Option<bool>,
    #[serde(default)]
    pub mentors: Vec<String>,
    #[serde(default)]
    pub camera_required: Option<bool>,
    #[serde(default)]
    pub microphone_required: Option<bool>,
    #[serde(default)]
    pub screen_share_required: Option<bool>,
    #[serde(default)]
    pub fullscreen_required: Option<bool>,
    #[serde(default)]
    pub face_check_interval_secs: Option<u64>,
    #[serde(default)]
    pub frame_interval_secs: Option<u64>,
}

impl ProctorConfig {
    pub fn exam(&self, exam_id: &str) -> Option<&ExamConfig> {
        self.exams.iter().find(|exam| exam.id == exam_id)
    }

    /// Exam overrides merged over `[defaults]`. `None` when the exam is not
    /// listed and unlisted exams are not allowed.
    pub fn settings_for(&self, exam_id: &str) -> Option<SessionSettings> {
        let defaults = &self.defaults;
        let exam = match self.exam(exam_id) {
            Some(exam) => Some(exam),
            None if defaults.allow_unlisted_exams => None,
            None => return None,
        };

        let pick = |value: Option<bool>, fallback: bool| value.unwrap_or(fallback);
        Some(SessionSettings {
            exam_id: exam_id.to_string(),
            title: exam.and_then(|exam| exam.title.clone()),
            proctoring_enabled: pick(
                exam.and_then(|exam| exam.proctoring_enabled),
                defaults.proctoring_enabled,
            ),
            camera_required: pick(
                exam.and_then(|exam| exam.camera_required),
                defaults.camera_required,
            ),
            microphone_required: pick(
                exam.and_then(|exam| exam.microphone_required),
                defaults.microphone_required,
            ),
            screen_share_required: pick(
                exam.and_then(|exam| exam.screen_share_required),
                defaults.screen_share_required,
            ),
            fullscreen_required: pick(
                exam.and_then(|exam| exam.fullscreen_required),
                defaults.fullscreen_required,
            ),
            violation_threshold: self.policy.block_threshold,
            face_check_interval_secs: exam
                .and_then(|exam| exam.face_check_interval_secs)
                .unwrap_or(defaults.face_check_interval_secs),
            frame_interval_secs: exam
                .and_then(|exam| exam.frame_interval_secs)
                .unwrap_or(defaults.frame_interval_secs),
            cooldown_secs: self.policy.cooldown_secs,
        })
    }
}

pub fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_runtime_config(path: Option<PathBuf>) -> Result<ProctorConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(ProctorConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read proctor config {}: {}",
            config_path.display(),
            err
        )
    })?;
    let config = toml::from_str::<ProctorConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse proctor config {}: {}",
            config_path.display(),
            err
        )
    })?;
    config.validate()?;
    Ok(config)
}

impl ProctorConfig {
    fn validate(&self) -> Result<(), String> {
        if self.policy.block_threshold == 0 {
            return Err("policy.block_threshold must be at least 1".to_string());
        }
        if self.policy.flag_threshold > 100 {
            return Err("policy.flag_threshold must be within 0..=100".to_string());
        }
        if self.relay.subscriber_buffer == 0 {
            return Err("relay.subscriber_buffer must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_block_threshold() -> usize {
    5
}

fn default_flag_threshold() -> u32 {
    80
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_weight_low() -> u32 {
    10
}

fn default_weight_medium() -> u32 {
    25
}

fn default_weight_high() -> u32 {
    50
}

fn default_weight_critical() -> u32 {
    100
}

fn default_subscriber_buffer() -> usize {
    4
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_max_stream_connections() -> usize {
    128
}

fn default_producer_idle_timeout_secs() -> u64 {
    30
}

fn default_viewer_heartbeat_secs() -> u64 {
    5
}

fn default_max_connections() -> usize {
    64
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_inactivity_warn_secs() -> u64 {
    300
}

fn default_face_check_interval_secs() -> u64 {
    5
}

fn default_frame_interval_secs() -> u64 {
    2
}
