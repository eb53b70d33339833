//! Control API tests through the full axum router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{wait_until, Harness, TOKEN};
use http_body_util::BodyExt;
use rotor_common::ConnectivityMode;
use rotord::drivers::FakeBringUp;
use rotord::notifier::NotificationKind;
use serde_json::Value;
use tower::ServiceExt;

fn get(uri: &str, auth: Option<&str>) -> Request<Body> {
    request("GET", uri, auth)
}

fn post(uri: &str, auth: Option<&str>) -> Request<Body> {
    request("POST", uri, auth)
}

fn request(method: &str, uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::empty()).unwrap()
}

fn bearer() -> Option<&'static str> {
    Some("Bearer test-token-0123456789")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

// ============================================================================
// Status
// ============================================================================

#[tokio::test]
async fn test_status_is_public() {
    let h = Harness::new(|_| {});
    let (app, _) = h.router();

    let (status, body) = send(&app, get("/status", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["public_ip"], "1.2.3.4");
    assert_eq!(body["connection_mode"], "rndis");
    assert_eq!(body["interface"], "usb0");
    assert_eq!(body["connected"], true);
    assert_eq!(body["rotating"], false);
}

#[tokio::test]
async fn test_status_without_cellular_link() {
    let h = Harness::new(|_| {});
    h.probe.set(ConnectivityMode::Rndis, rotord::probe::Detection::absent());
    let (app, _) = h.router();

    let (_, body) = send(&app, get("/status", None)).await;
    assert_eq!(body["connection_mode"], "none");
    assert_eq!(body["connected"], false);
    assert_eq!(body["public_ip"], Value::Null);
}

// ============================================================================
// Auth
// ============================================================================

#[tokio::test]
async fn test_rotate_without_token_is_rejected_untouched() {
    let h = Harness::new(|_| {});
    let (app, _) = h.router();

    let (status, body) = send(&app, post("/rotate", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "unauthorized");

    let (status, _) = send(&app, post("/rotate", Some("Bearer wrong-token"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(h.rndis.teardowns(), 0);
    assert_eq!(h.ip.calls(), 0);
    assert!(!h.orchestrator.state().is_rotating());
}

#[tokio::test]
async fn test_every_private_route_needs_token() {
    let h = Harness::new(|_| {});
    let (app, _) = h.router();

    for (method, uri) in [
        ("GET", "/history"),
        ("POST", "/notify"),
        ("GET", "/auto-rotation/status"),
        ("POST", "/auto-rotation/enable"),
        ("POST", "/auto-rotation/disable"),
        ("POST", "/auto-rotation/restart"),
        ("GET", "/config"),
        ("GET", "/modem/imei"),
    ] {
        let (status, _) = send(&app, request(method, uri, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{} {}", method, uri);
    }
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_bare_token_accepted() {
    let h = Harness::new(|_| {});
    let (app, _) = h.router();

    let (status, body) = send(&app, get("/history", Some(TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["ips"].is_array());
}

// ============================================================================
// Rotate
// ============================================================================

#[tokio::test]
async fn test_rotate_success_is_200() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "5.6.7.8"]);
    let (app, _) = h.router();

    let (status, body) = send(&app, post("/rotate", bearer())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["public_ip"], "5.6.7.8");
    assert_eq!(body["previous_ip"], "1.2.3.4");
    assert_eq!(body["attempts"], 1);
}

#[tokio::test]
async fn test_rotate_same_ip_is_400() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4"]);
    let (app, _) = h.router();

    let (status, body) = send(&app, post("/rotate", bearer())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "failed");
    assert!(body["error"].as_str().unwrap().contains("unchanged"));
}

#[tokio::test]
async fn test_rotate_driver_exhaustion_is_500() {
    let h = Harness::new(|_| {});
    h.rndis.script(vec![FakeBringUp::Fail("no carrier".to_string())]);
    let (app, _) = h.router();

    let (status, body) = send(&app, post("/rotate", bearer())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "failed");
}

#[tokio::test]
async fn test_concurrent_rotate_is_429() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "5.6.7.8"]);
    let gate = h.rndis.hold();
    let (app, _) = h.router();

    let first_app = app.clone();
    let first = tokio::spawn(async move { send(&first_app, post("/rotate", bearer())).await });
    let rndis = h.rndis.clone();
    wait_until(|| rndis.bring_ups() == 1).await;

    let (status, body) = send(&app, post("/rotate", bearer())).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status"], "busy");

    let (status, body) = send(&app, get("/status", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rotating"], true);
    assert_eq!(body["phase"], "bringing_up");

    let (status, body) = send(&app, get("/modem/imei", bearer())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "rotating");
    assert!(h.at.sent().is_empty());

    gate.notify_one();
    let (status, body) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["public_ip"], "5.6.7.8");
}

#[tokio::test]
async fn test_client_hangup_does_not_abort_rotation() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "5.6.7.8"]);
    let gate = h.rndis.hold();
    let (app, _) = h.router();

    let request_task = tokio::spawn(async move { send(&app, post("/rotate", bearer())).await });
    let rndis = h.rndis.clone();
    wait_until(|| rndis.bring_ups() == 1).await;
    request_task.abort();

    gate.notify_one();
    let state = h.orchestrator.clone();
    wait_until(|| !state.state().is_rotating()).await;
    assert_eq!(h.history.snapshot().await.last_ip(), Some("5.6.7.8"));
}

// ============================================================================
// History, notify, config, IMEI
// ============================================================================

#[tokio::test]
async fn test_history_after_rotation() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "5.6.7.8"]);
    let (app, _) = h.router();
    send(&app, post("/rotate", bearer())).await;

    let (status, body) = send(&app, get("/history", bearer())).await;
    assert_eq!(status, StatusCode::OK);
    let ips = body["ips"].as_array().unwrap();
    assert_eq!(ips.len(), 2);
    assert_eq!(ips[1]["ip"], "5.6.7.8");
    assert_eq!(body["rotations"], 1);
    assert!(body["first_seen"].is_string());
}

#[tokio::test]
async fn test_notify_pushes_status() {
    let h = Harness::new(|_| {});
    let (app, _) = h.router();

    let (status, body) = send(&app, post("/notify", bearer())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["ip"], "1.2.3.4");

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Status);
    assert_eq!(sent[0].mode, ConnectivityMode::Rndis);
}

#[tokio::test]
async fn test_config_is_redacted() {
    let h = Harness::new(|c| {
        c.proxy.password = "hunter2".to_string();
        c.discord.webhook_url = "https://discord.com/api/webhooks/1/secret".to_string();
    });
    let (app, _) = h.router();

    let (status, body) = send(&app, get("/config", bearer())).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.to_string();
    assert!(!text.contains(TOKEN));
    assert!(!text.contains("hunter2"));
    assert!(!text.contains("secret"));
    assert_eq!(body["discord_configured"], true);
    assert_eq!(body["apn"], "everywhere");
}

#[tokio::test]
async fn test_imei_audit() {
    let h = Harness::new(|_| {});
    h.at.respond("AT+CGSN", "861475040123456");
    let (app, _) = h.router();

    let (status, body) = send(&app, get("/modem/imei", bearer())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current"], "861475040123456");
    assert_eq!(body["original"], "861475040123456");
    assert_eq!(body["changed"], false);
}

#[tokio::test]
async fn test_imei_read_does_not_block_rotation() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "5.6.7.8"]);
    h.at.respond("AT+CGSN", "861475040123456");
    let gate = h.at.hold();
    let (app, _) = h.router();

    let imei_app = app.clone();
    let imei = tokio::spawn(async move { send(&imei_app, get("/modem/imei", bearer())).await });
    let at = h.at.clone();
    wait_until(|| !at.sent().is_empty()).await;

    let (_, body) = send(&app, get("/status", None)).await;
    assert_eq!(body["rotating"], false);

    let (status, body) = send(&app, post("/rotate", bearer())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["public_ip"], "5.6.7.8");

    gate.notify_one();
    let (status, body) = imei.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current"], "861475040123456");
}

// ============================================================================
// Auto-rotation control
// ============================================================================

#[tokio::test]
async fn test_auto_rotation_enable_disable() {
    let h = Harness::new(|c| c.pm2.ip_rotation_interval = 3600);
    let (app, _) = h.router();

    let (_, body) = send(&app, get("/auto-rotation/status", bearer())).await;
    assert_eq!(body["enabled"], false);
    assert_eq!(body["thread_alive"], false);
    assert_eq!(body["interval_s"], 3600);

    let (status, body) = send(&app, post("/auto-rotation/enable", bearer())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["thread_alive"], true);

    let (_, body) = send(&app, post("/auto-rotation/restart", bearer())).await;
    assert_eq!(body["enabled"], true);
    assert_eq!(body["thread_alive"], true);

    let (_, body) = send(&app, post("/auto-rotation/disable", bearer())).await;
    assert_eq!(body["enabled"], false);
    assert_eq!(body["thread_alive"], false);
    assert_eq!(body["next_rotation_at"], Value::Null);
    assert_eq!(h.rndis.teardowns(), 0);
}
