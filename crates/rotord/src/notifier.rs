//! Notification sink - rotation results and status pushes.
//!
//! Discord is the only real sink. It keeps a single status message per
//! channel by remembering the message id and editing it in place; a
//! failed edit (message deleted, webhook rotated) posts a fresh one.

use crate::error::NotifyError;
use async_trait::async_trait;
use chrono::Utc;
use rotor_common::{ConnectivityMode, DiscordConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const COLOR_OK: u32 = 0x2ecc71;
const COLOR_FAIL: u32 = 0xe74c3c;
const COLOR_INFO: u32 = 0x3498db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Rotation,
    /// Manual push of the current state
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub ip: Option<String>,
    pub previous_ip: Option<String>,
    pub is_failure: bool,
    pub error: Option<String>,
    pub mode: ConnectivityMode,
    pub attempts: u32,
}

impl Notification {
    pub fn status(ip: Option<String>, mode: ConnectivityMode) -> Self {
        Self {
            kind: NotificationKind::Status,
            ip,
            previous_ip: None,
            is_failure: false,
            error: None,
            mode,
            attempts: 0,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sink used when no webhook is configured
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!("  Notifications disabled, dropping {:?}", notification.kind);
        Ok(())
    }
}

/// Discord webhook sink with edit-in-place
pub struct DiscordNotifier {
    client: reqwest::Client,
    webhook_url: String,
    message_id_path: PathBuf,
}

impl DiscordNotifier {
    pub fn new(webhook_url: &str, message_id_path: PathBuf) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.trim().trim_end_matches('/').to_string(),
            message_id_path,
        })
    }

    /// Discord sink when configured, otherwise [`NullNotifier`]
    pub fn from_config(
        config: &DiscordConfig,
        message_id_path: PathBuf,
    ) -> Arc<dyn NotificationSink> {
        if !config.is_configured() {
            info!("  Discord webhook not configured, notifications off");
            return Arc::new(NullNotifier);
        }
        match Self::new(&config.webhook_url, message_id_path) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                warn!("  Discord client init failed ({}), notifications off", e);
                Arc::new(NullNotifier)
            }
        }
    }

    fn stored_id(&self) -> Option<String> {
        std::fs::read_to_string(&self.message_id_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn store_id(&self, id: &str) {
        if let Some(parent) = self.message_id_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.message_id_path, id) {
            warn!("  Could not save Discord message id: {}", e);
        }
    }

    async fn edit(&self, id: &str, payload: &Value) -> Result<(), NotifyError> {
        let url = format!("{}/messages/{}", self.webhook_url, id);
        let response = self.client.patch(&url).json(payload).send().await?;
        check(response).await.map(|_| ())
    }

    async fn post(&self, payload: &Value) -> Result<String, NotifyError> {
        let url = format!("{}?wait=true", self.webhook_url);
        let response = self.client.post(&url).json(payload).send().await?;
        let body = check(response).await?;
        let value: Value = serde_json::from_str(&body).map_err(|_| NotifyError::MissingId)?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(NotifyError::MissingId)
    }
}

async fn check(response: reqwest::Response) -> Result<String, NotifyError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(body)
    } else {
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Webhook payload for a notification
pub fn render(notification: &Notification) -> Value {
    let (title, color) = match (notification.kind, notification.is_failure) {
        (NotificationKind::Status, _) => ("4G Proxy Status", COLOR_INFO),
        (NotificationKind::Rotation, false) => ("IP Rotated", COLOR_OK),
        (NotificationKind::Rotation, true) => ("IP Rotation Failed", COLOR_FAIL),
    };
    let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "Unknown".to_string());

    let mut fields = vec![
        json!({"name": "Current IP", "value": or_unknown(&notification.ip), "inline": true}),
    ];
    if notification.kind == NotificationKind::Rotation {
        fields.push(json!({"name": "Previous IP", "value": or_unknown(&notification.previous_ip), "inline": true}));
        fields.push(json!({"name": "Attempts", "value": notification.attempts.to_string(), "inline": true}));
    }
    fields.push(json!({"name": "Mode", "value": notification.mode.as_str().to_uppercase(), "inline": true}));
    if let Some(error) = &notification.error {
        fields.push(json!({"name": "Error", "value": error, "inline": false}));
    }

    json!({
        "embeds": [{
            "title": title,
            "color": color,
            "fields": fields,
            "timestamp": Utc::now().to_rfc3339(),
        }]
    })
}

#[async_trait]
impl NotificationSink for DiscordNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = render(notification);

        if let Some(id) = self.stored_id() {
            match self.edit(&id, &payload).await {
                Ok(()) => {
                    debug!("  Discord message {} updated", id);
                    return Ok(());
                }
                Err(e) => warn!("  Discord edit failed ({}), posting new message", e),
            }
        }

        let id = self.post(&payload).await?;
        self.store_id(&id);
        debug!("  Discord message {} posted", id);
        Ok(())
    }
}

// ============================================================================
// Recording notifier (testing)
// ============================================================================

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
        Ok(())
    }
}
