//! Control API payloads shared by rotord and rotorctl.

use crate::config::{AutoRotationConfig, RotationSettings, RotorConfig};
use crate::mode::{ConnectivityMode, ModePreference};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Orchestrator state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    #[default]
    Idle,
    Probing,
    TearingDown,
    DeepResetting,
    BringingUp,
    Verifying,
    Succeeded,
    Failed,
}

impl RotationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationPhase::Idle => "idle",
            RotationPhase::Probing => "probing",
            RotationPhase::TearingDown => "tearing_down",
            RotationPhase::DeepResetting => "deep_resetting",
            RotationPhase::BringingUp => "bringing_up",
            RotationPhase::Verifying => "verifying",
            RotationPhase::Succeeded => "succeeded",
            RotationPhase::Failed => "failed",
        }
    }
}

/// GET /status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub public_ip: Option<String>,
    pub connection_mode: ConnectivityMode,
    pub interface: Option<String>,
    pub connected: bool,
    /// A rotation is in flight; fields come from the last known state
    #[serde(default)]
    pub rotating: bool,
    #[serde(default)]
    pub phase: RotationPhase,
    #[serde(default)]
    pub version: String,
}

/// Outcome class of a rotation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotateStatus {
    Success,
    Failed,
    Busy,
}

/// Per-attempt record, returned inline with the rotation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationAttemptResult {
    pub attempt_number: u32,
    pub previous_ip: Option<String>,
    pub observed_ip: Option<String>,
    pub succeeded: bool,
    #[serde(default)]
    pub deep_reset: bool,
    pub error: Option<String>,
}

/// POST /rotate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateResponse {
    pub status: RotateStatus,
    pub public_ip: Option<String>,
    pub previous_ip: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConnectivityMode>,
    #[serde(default)]
    pub attempt_log: Vec<RotationAttemptResult>,
}

impl RotateResponse {
    pub fn busy() -> Self {
        Self {
            status: RotateStatus::Busy,
            public_ip: None,
            previous_ip: None,
            attempts: 0,
            error: Some("Rotation already in progress, retry shortly".to_string()),
            mode: None,
            attempt_log: Vec::new(),
        }
    }
}

/// POST /notify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub status: String,
    pub ip: Option<String>,
}

/// GET /auto-rotation/status and the enable/disable/restart replies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRotationStatus {
    pub enabled: bool,
    pub interval_s: u64,
    pub thread_alive: bool,
    pub next_rotation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase: RotationPhase,
}

/// GET /modem/imei
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImeiStatus {
    pub original: Option<String>,
    pub current: Option<String>,
    pub changed: bool,
}

/// Body for every non-2xx reply that is not a rotation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(status: &str, error: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            error: error.into(),
        }
    }
}

/// GET /config - no token, passwords or webhook URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactedConfig {
    pub lan_ip: String,
    pub api_port: u16,
    pub proxy_http_port: u16,
    pub proxy_socks_port: u16,
    pub proxy_auth_enabled: bool,
    pub modem_mode: ModePreference,
    pub apn: String,
    pub rotation: RotationSettings,
    pub pm2: AutoRotationConfig,
    pub discord_configured: bool,
}

impl From<&RotorConfig> for RedactedConfig {
    fn from(config: &RotorConfig) -> Self {
        Self {
            lan_ip: config.lan_bind_ip.clone(),
            api_port: config.api.port,
            proxy_http_port: config.proxy.http_port,
            proxy_socks_port: config.proxy.socks_port,
            proxy_auth_enabled: config.proxy.auth_enabled,
            modem_mode: config.modem.mode,
            apn: config.modem.apn.clone(),
            rotation: config.rotation.clone(),
            pm2: config.pm2.clone(),
            discord_configured: config.discord.is_configured(),
        }
    }
}
