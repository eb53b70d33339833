//! Rotor configuration.
//!
//! Loaded from a YAML file (`/etc/rotor/config.yaml` unless `ROTOR_CONFIG`
//! or `--config` says otherwise). Every field has a default so a partial
//! file written by the installer still loads. The rotation section is
//! re-read at the start of every rotation so operators can tune waits
//! without restarting the daemon.

use crate::error::ConfigError;
use crate::mode::{DeepResetMethod, ModePreference};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rotor/config.yaml";

/// Environment override for the config file location
pub const CONFIG_ENV_VAR: &str = "ROTOR_CONFIG";

/// Default state directory (history, original IMEI, notification id)
pub const DEFAULT_STATE_DIR: &str = "/var/lib/rotor";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotorConfig {
    /// LAN address the proxy listens on
    #[serde(default = "default_lan_bind_ip")]
    pub lan_bind_ip: String,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub modem: ModemConfig,

    #[serde(default)]
    pub rotation: RotationSettings,

    /// Auto-rotation timer (section name kept from the process-manager era)
    #[serde(default)]
    pub pm2: AutoRotationConfig,

    #[serde(default)]
    pub discord: DiscordConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub system: SystemConfig,
}

fn default_lan_bind_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

impl Default for RotorConfig {
    fn default() -> Self {
        Self {
            lan_bind_ip: default_lan_bind_ip(),
            api: ApiConfig::default(),
            proxy: ProxyConfig::default(),
            modem: ModemConfig::default(),
            rotation: RotationSettings::default(),
            pm2: AutoRotationConfig::default(),
            discord: DiscordConfig::default(),
            routing: RoutingConfig::default(),
            verify: VerifyConfig::default(),
            state_dir: default_state_dir(),
            system: SystemConfig::default(),
        }
    }
}

/// Control API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on mutating and history endpoints
    #[serde(default)]
    pub token: String,
}

fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8088
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            port: default_api_port(),
            token: String::new(),
        }
    }
}

/// Proxy listener settings, used to verify the public IP through the cellular egress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Host the proxy listens on; falls back to `lan_bind_ip`
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub auth_enabled: bool,
}

fn default_http_port() -> u16 {
    3128
}

fn default_socks_port() -> u16 {
    1080
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: None,
            http_port: default_http_port(),
            socks_port: default_socks_port(),
            user: String::new(),
            password: String::new(),
            auth_enabled: false,
        }
    }
}

/// Modem and transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    #[serde(default)]
    pub mode: ModePreference,

    /// Carrier APN; empty means auto-detect from the SIM
    #[serde(default)]
    pub apn: String,

    /// AT command serial port; auto-detected when unset
    #[serde(default)]
    pub port: Option<String>,

    /// AT command timeout in seconds
    #[serde(default = "default_modem_timeout")]
    pub timeout: u64,

    /// QMI control device node
    #[serde(default = "default_qmi_device")]
    pub qmi_device: String,

    /// DHCP client binary; first available of udhcpc/dhclient/dhcpcd when unset
    #[serde(default)]
    pub dhcp_client: Option<String>,

    /// Name of the pppd peer profile
    #[serde(default = "default_ppp_peer")]
    pub ppp_peer: String,

    #[serde(default = "default_peers_dir")]
    pub peers_dir: PathBuf,

    #[serde(default = "default_chat_dir")]
    pub chat_dir: PathBuf,
}

fn default_modem_timeout() -> u64 {
    10
}

fn default_qmi_device() -> String {
    "/dev/cdc-wdm0".to_string()
}

fn default_ppp_peer() -> String {
    "rotor".to_string()
}

fn default_peers_dir() -> PathBuf {
    PathBuf::from("/etc/ppp/peers")
}

fn default_chat_dir() -> PathBuf {
    PathBuf::from("/etc/chatscripts")
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            mode: ModePreference::Auto,
            apn: String::new(),
            port: None,
            timeout: default_modem_timeout(),
            qmi_device: default_qmi_device(),
            dhcp_client: None,
            ppp_peer: default_ppp_peer(),
            peers_dir: default_peers_dir(),
            chat_dir: default_chat_dir(),
        }
    }
}

/// Rotation tunables as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSettings {
    /// Seconds to stay torn down before bring-up
    #[serde(default = "default_teardown_wait", alias = "ppp_teardown_wait")]
    pub teardown_wait: u64,

    /// Seconds to wait for the interface to get an IP after bring-up
    #[serde(default = "default_restart_wait", alias = "ppp_restart_wait")]
    pub restart_wait: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_true")]
    pub deep_reset_enabled: bool,

    #[serde(default)]
    pub deep_reset_method: DeepResetMethod,

    /// Seconds to wait for network re-registration after a radio toggle
    #[serde(default = "default_deep_reset_wait")]
    pub deep_reset_wait: u64,

    /// First attempt that deep-resets (1 = every attempt)
    #[serde(default = "default_deep_reset_from_attempt")]
    pub deep_reset_from_attempt: u32,

    /// Seconds between interface ready and the public IP check
    #[serde(default = "default_settle_wait")]
    pub settle_wait: u64,

    /// Cycle 4G/3G and the APN before an RNDIS teardown
    #[serde(default = "default_true")]
    pub rndis_smart_refresh: bool,
}

fn default_teardown_wait() -> u64 {
    30
}

fn default_restart_wait() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_deep_reset_wait() -> u64 {
    20
}

fn default_deep_reset_from_attempt() -> u32 {
    1
}

fn default_settle_wait() -> u64 {
    5
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            teardown_wait: default_teardown_wait(),
            restart_wait: default_restart_wait(),
            max_attempts: default_max_attempts(),
            deep_reset_enabled: true,
            deep_reset_method: DeepResetMethod::default(),
            deep_reset_wait: default_deep_reset_wait(),
            deep_reset_from_attempt: default_deep_reset_from_attempt(),
            settle_wait: default_settle_wait(),
            rndis_smart_refresh: true,
        }
    }
}

/// Auto-rotation timer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRotationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between scheduled rotations
    #[serde(default = "default_rotation_interval")]
    pub ip_rotation_interval: u64,
}

fn default_rotation_interval() -> u64 {
    3600
}

impl Default for AutoRotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ip_rotation_interval: default_rotation_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub webhook_url: String,
}

impl DiscordConfig {
    /// True when the webhook looks real (installer writes a placeholder)
    pub fn is_configured(&self) -> bool {
        let url = self.webhook_url.trim();
        (url.starts_with("https://discord.com/api/webhooks/")
            || url.starts_with("https://discordapp.com/api/webhooks/"))
            && !url.contains("YOUR_WEBHOOK_ID")
    }
}

/// Host routing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// LAN/WiFi uplink; detected from the lowest-metric non-cellular default route when unset
    #[serde(default)]
    pub lan_interface: Option<String>,

    /// Metric for the secondary cellular default route
    #[serde(default = "default_cellular_metric")]
    pub cellular_metric: u32,

    /// Packet mark set on proxy-user traffic
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,

    #[serde(default = "default_table_id")]
    pub table_id: u32,

    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// System user the proxy runs as
    #[serde(default = "default_proxy_user")]
    pub proxy_user: String,

    /// Maintain the policy table, ip rule and mangle mark
    #[serde(default = "default_true")]
    pub manage_policy: bool,
}

fn default_cellular_metric() -> u32 {
    700
}

fn default_fwmark() -> u32 {
    1
}

fn default_table_id() -> u32 {
    101
}

fn default_table_name() -> String {
    "rndis".to_string()
}

fn default_proxy_user() -> String {
    "proxy".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            lan_interface: None,
            cellular_metric: default_cellular_metric(),
            fwmark: default_fwmark(),
            table_id: default_table_id(),
            table_name: default_table_name(),
            proxy_user: default_proxy_user(),
            manage_policy: true,
        }
    }
}

/// Public IP verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Plain-text "what is my IP" endpoints, tried in order
    #[serde(default = "default_verify_urls")]
    pub urls: Vec<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_verify_timeout")]
    pub timeout: u64,
}

fn default_verify_urls() -> Vec<String> {
    vec![
        "https://api.ipify.org".to_string(),
        "https://ipv4.icanhazip.com".to_string(),
        "https://ifconfig.co/ip".to_string(),
    ]
}

fn default_verify_timeout() -> u64 {
    15
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            urls: default_verify_urls(),
            timeout: default_verify_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Prefix privileged commands with `sudo -n`
    #[serde(default)]
    pub sudo: bool,

    /// Default timeout for shell commands in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            sudo: false,
            command_timeout: default_command_timeout(),
        }
    }
}

impl RotorConfig {
    /// Config path from the environment, or the default location
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.token.trim().is_empty() {
            return Err(ConfigError::Invalid("api.token must not be empty".to_string()));
        }
        if self.api.port == 0 {
            return Err(ConfigError::Invalid("api.port must not be 0".to_string()));
        }
        if self.rotation.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "rotation.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Host the proxy listens on
    pub fn proxy_host(&self) -> &str {
        self.proxy.host.as_deref().unwrap_or(&self.lan_bind_ip)
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths::new(&self.state_dir)
    }

    /// Snapshot of the rotation tunables for one rotation
    pub fn rotation_config(&self) -> RotationConfig {
        RotationConfig::from(self)
    }
}

/// Files the daemon owns under the state directory
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub history: PathBuf,
    pub original_imei: PathBuf,
    pub notification_message_id: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            history: state_dir.join("ip_history.json"),
            original_imei: state_dir.join("original_imei.txt"),
            notification_message_id: state_dir.join("discord_message_id.txt"),
        }
    }
}

/// Rotation tunables resolved for a single rotation.
///
/// Built fresh from the config at the start of every rotation.
/// `max_attempts` and `deep_reset_from_attempt` are always at least 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub teardown_wait_s: u64,
    pub restart_wait_s: u64,
    pub max_attempts: u32,
    pub deep_reset_enabled: bool,
    pub deep_reset_method: DeepResetMethod,
    pub deep_reset_wait_s: u64,
    pub deep_reset_from_attempt: u32,
    pub settle_wait_s: u64,
    pub rndis_smart_refresh: bool,
    pub apn: String,
    pub mode_preference: ModePreference,
}

impl RotationConfig {
    /// Whether this attempt deep-resets by schedule alone
    pub fn deep_reset_scheduled(&self, attempt: u32) -> bool {
        self.deep_reset_enabled
            && self.deep_reset_method != DeepResetMethod::None
            && attempt >= self.deep_reset_from_attempt
    }

    /// Deep reset is possible at all
    pub fn deep_reset_available(&self) -> bool {
        self.deep_reset_enabled && self.deep_reset_method != DeepResetMethod::None
    }
}

impl From<&RotorConfig> for RotationConfig {
    fn from(config: &RotorConfig) -> Self {
        let r = &config.rotation;

        let max_attempts = if r.max_attempts == 0 {
            warn!("rotation.max_attempts is 0, using 1");
            1
        } else {
            r.max_attempts
        };

        Self {
            teardown_wait_s: r.teardown_wait,
            restart_wait_s: r.restart_wait,
            max_attempts,
            deep_reset_enabled: r.deep_reset_enabled,
            deep_reset_method: r.deep_reset_method,
            deep_reset_wait_s: r.deep_reset_wait,
            deep_reset_from_attempt: r.deep_reset_from_attempt.max(1),
            settle_wait_s: r.settle_wait,
            rndis_smart_refresh: r.rndis_smart_refresh,
            apn: config.modem.apn.trim().to_string(),
            mode_preference: config.modem.mode,
        }
    }
}
