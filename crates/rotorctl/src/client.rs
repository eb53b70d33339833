//! Control API client - talks to rotord over HTTP

use anyhow::{Context, Result};
use reqwest::StatusCode;
use rotor_common::{
    AutoRotationStatus, ErrorResponse, ImeiStatus, IpHistory, NotifyResponse, RedactedConfig,
    RotateResponse, RotorConfig, StatusResponse,
};
use serde::de::DeserializeOwned;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A rotation can run through several attempts with long modem waits
const ROTATE_TIMEOUT: Duration = Duration::from_secs(900);

/// Base URL for the daemon described by `config`
pub fn base_url(config: &RotorConfig) -> String {
    let host = match config.api.bind.as_str() {
        "0.0.0.0" | "" => "127.0.0.1",
        host => host,
    };
    format!("http://{}:{}", host, config.api.port)
}

/// `Authorization` header value for a token
pub fn auth_header(token: &str) -> String {
    format!("Bearer {}", token.trim())
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rotorctl/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get("/status").await
    }

    /// Request a rotation. Failed and busy rotations still carry a
    /// rotation body, so the HTTP status is returned alongside it.
    pub async fn rotate(&self) -> Result<(StatusCode, RotateResponse)> {
        let response = self
            .authorized(self.client.post(self.url("/rotate")))
            .timeout(ROTATE_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to connect to rotord at {}", self.base_url))?;

        let status = response.status();
        let bytes = response.bytes().await.context("Failed to read rotate response")?;
        match serde_json::from_slice::<RotateResponse>(&bytes) {
            Ok(body) => Ok((status, body)),
            Err(_) => Err(error_from(status, &bytes)),
        }
    }

    pub async fn history(&self) -> Result<IpHistory> {
        self.get("/history").await
    }

    pub async fn notify(&self) -> Result<NotifyResponse> {
        self.post("/notify").await
    }

    pub async fn auto_status(&self) -> Result<AutoRotationStatus> {
        self.get("/auto-rotation/status").await
    }

    /// `action` is one of `enable`, `disable`, `restart`
    pub async fn auto_action(&self, action: &str) -> Result<AutoRotationStatus> {
        self.post(&format!("/auto-rotation/{}", action)).await
    }

    pub async fn config(&self) -> Result<RedactedConfig> {
        self.get("/config").await
    }

    pub async fn imei(&self) -> Result<ImeiStatus> {
        self.get("/modem/imei").await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.authorized(self.client.get(self.url(path)));
        self.send(request).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.authorized(self.client.post(self.url(path)));
        self.send(request).await
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to connect to rotord at {}", self.base_url))?;

        let status = response.status();
        let bytes = response.bytes().await.context("Failed to read response body")?;
        if !status.is_success() {
            return Err(error_from(status, &bytes));
        }
        serde_json::from_slice(&bytes).context("Failed to parse rotord response")
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, auth_header(token)),
            None => request,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Error for a non-2xx reply, using the daemon's error body when there is one
fn error_from(status: StatusCode, body: &[u8]) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED {
        return anyhow::anyhow!("rotord rejected the API token (401); check api.token or --token");
    }
    match serde_json::from_slice::<ErrorResponse>(body) {
        Ok(err) => anyhow::anyhow!("rotord returned {} ({}): {}", status, err.status, err.error),
        Err(_) => anyhow::anyhow!(
            "rotord returned {}: {}",
            status,
            String::from_utf8_lossy(body).trim()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_from_config() {
        let mut config = RotorConfig::default();
        config.api.bind = "0.0.0.0".to_string();
        config.api.port = 9000;
        assert_eq!(base_url(&config), "http://127.0.0.1:9000");

        config.api.bind = "192.168.1.50".to_string();
        assert_eq!(base_url(&config), "http://192.168.1.50:9000");
    }

    #[test]
    fn test_auth_header() {
        assert_eq!(auth_header(" abc123\n"), "Bearer abc123");
    }

    #[test]
    fn test_blank_token_is_dropped() {
        let client = ApiClient::new("http://127.0.0.1:8088/", Some("   ".to_string())).unwrap();
        assert!(client.token.is_none());
        assert_eq!(client.base_url(), "http://127.0.0.1:8088");
        assert_eq!(client.url("/status"), "http://127.0.0.1:8088/status");
    }

    #[test]
    fn test_error_from_daemon_body() {
        let body = br#"{"status":"rotating","error":"Rotation in progress, modem busy"}"#;
        let err = error_from(StatusCode::CONFLICT, body).to_string();
        assert!(err.contains("rotating"));
        assert!(err.contains("modem busy"));

        let err = error_from(StatusCode::UNAUTHORIZED, b"").to_string();
        assert!(err.contains("token"));

        let err = error_from(StatusCode::BAD_GATEWAY, b"upstream down").to_string();
        assert!(err.contains("upstream down"));
    }
}
