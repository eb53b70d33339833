//! Orchestrator scenarios against fake collaborators.
//!
//! No hardware, no network: every driver, probe, route and IP lookup is a
//! fake, and every wait is configured to zero.

mod common;

use common::{lan, wait_until, Harness};
use rotor_common::{ConnectivityMode, DeepResetMethod, ModePreference, RotateStatus, RotationPhase};
use rotord::drivers::FakeBringUp;
use rotord::notifier::NotificationKind;
use rotord::probe::Detection;
use rotord::{OutcomeKind, RotationTrigger};

// ============================================================================
// Success and retry
// ============================================================================

#[tokio::test]
async fn test_bring_up_failure_then_success() {
    let h = Harness::new(|c| c.rotation.max_attempts = 2);
    h.rndis.script(vec![
        FakeBringUp::Fail("modem busy".to_string()),
        FakeBringUp::Ok("usb0".to_string()),
    ]);
    h.ips(&["1.2.3.4", "5.6.7.8"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;

    assert_eq!(outcome.kind, OutcomeKind::Succeeded);
    let response = outcome.response;
    assert_eq!(response.status, RotateStatus::Success);
    assert_eq!(response.attempts, 2);
    assert_eq!(response.public_ip.as_deref(), Some("5.6.7.8"));
    assert_eq!(response.previous_ip.as_deref(), Some("1.2.3.4"));
    assert_eq!(response.mode, Some(ConnectivityMode::Rndis));
    assert!(!response.attempt_log[0].succeeded);
    assert!(response.attempt_log[0].error.as_deref().unwrap().contains("modem busy"));
    assert!(response.attempt_log[1].succeeded);

    let history = h.history.snapshot().await;
    assert_eq!(history.last_ip(), Some("5.6.7.8"));
    assert!(history.ips.iter().all(|e| !e.failed));
    assert_eq!(history.rotations, 1);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].is_failure);
    assert_eq!(sent[0].ip.as_deref(), Some("5.6.7.8"));
    assert_eq!(h.rndis.log()[1], "bring_up apn=everywhere");
}

#[tokio::test]
async fn test_unknown_starting_ip_accepts_any_public_ip() {
    let h = Harness::new(|_| {});
    h.ips(&["unknown", "5.6.7.8"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;
    assert_eq!(outcome.kind, OutcomeKind::Succeeded);
    assert_eq!(outcome.response.previous_ip, None);
}

// ============================================================================
// Logical failures
// ============================================================================

#[tokio::test]
async fn test_same_ip_is_failure_with_forced_history_entry() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;

    assert_eq!(outcome.kind, OutcomeKind::LogicalFailure);
    assert_eq!(outcome.response.status, RotateStatus::Failed);
    assert!(outcome.response.error.as_deref().unwrap().contains("unchanged"));

    let history = h.history.snapshot().await;
    assert_eq!(history.ips.len(), 2);
    let forced = history.last_entry().unwrap();
    assert!(forced.failed);
    assert_eq!(forced.ip, "1.2.3.4");
    assert!(forced.note.is_some());
    assert_eq!(history.rotations, 1);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_failure);
    assert_eq!(sent[0].kind, NotificationKind::Rotation);
    assert_eq!(sent[0].previous_ip.as_deref(), Some("1.2.3.4"));
}

#[tokio::test]
async fn test_private_ip_is_never_success() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "192.168.1.50"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;

    assert_eq!(outcome.kind, OutcomeKind::LogicalFailure);
    assert!(outcome
        .response
        .error
        .as_deref()
        .unwrap()
        .contains("cellular routing broken"));
    assert_eq!(h.history.snapshot().await.last_ip(), Some("1.2.3.4"));
}

#[tokio::test]
async fn test_unknown_ip_is_never_success() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "unknown"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;

    assert_eq!(outcome.kind, OutcomeKind::LogicalFailure);
    assert_eq!(outcome.response.public_ip, None);
    let forced = h.history.snapshot().await.last_entry().cloned().unwrap();
    assert!(forced.failed);
    assert_eq!(forced.ip, "1.2.3.4");
}

// ============================================================================
// Driver failures and routes
// ============================================================================

#[tokio::test]
async fn test_exhausted_bring_up_is_driver_failure() {
    let h = Harness::new(|c| c.rotation.max_attempts = 2);
    h.rndis.script(vec![FakeBringUp::Fail("WDS start failed".to_string())]);
    h.hijack_on_bring_up();

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;

    assert_eq!(outcome.kind, OutcomeKind::DriverFailure);
    assert_eq!(outcome.response.attempts, 2);
    assert_eq!(h.rndis.bring_ups(), 2);
    assert_eq!(h.routes.routes(), vec![lan()]);
    assert!(h.notifier.sent()[0].is_failure);
}

#[tokio::test]
async fn test_interface_never_ready_is_driver_failure() {
    let h = Harness::new(|_| {});
    h.rndis.set_ready(false);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;

    assert_eq!(outcome.kind, OutcomeKind::DriverFailure);
    assert!(outcome.response.error.as_deref().unwrap().contains("not ready"));
    assert!(h.routes.secured().is_empty());
}

#[tokio::test]
async fn test_primary_route_stays_lowest_after_success() {
    let h = Harness::new(|_| {});
    h.hijack_on_bring_up();
    h.ips(&["1.2.3.4", "5.6.7.8"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;
    assert_eq!(outcome.kind, OutcomeKind::Succeeded);

    let routes = h.routes.routes();
    let lowest = routes.iter().min_by_key(|r| r.metric).unwrap();
    assert_eq!(lowest.dev, "wlan0");
    assert!(routes.iter().any(|r| r.dev == "usb0" && r.metric == 700));
    assert_eq!(h.routes.secured(), vec!["usb0"]);
}

// ============================================================================
// Deep reset escalation
// ============================================================================

#[tokio::test]
async fn test_same_ip_escalates_next_attempt_to_deep_reset() {
    let h = Harness::new(|c| {
        c.rotation.max_attempts = 2;
        c.rotation.deep_reset_enabled = true;
        c.rotation.deep_reset_method = DeepResetMethod::RadioCycle;
        c.rotation.deep_reset_from_attempt = 3;
    });
    h.ips(&["1.2.3.4"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;

    assert_eq!(outcome.kind, OutcomeKind::LogicalFailure);
    let log = &outcome.response.attempt_log;
    assert!(!log[0].deep_reset);
    assert!(log[1].deep_reset);
    assert_eq!(h.reset.calls(), vec![DeepResetMethod::RadioCycle]);
    assert_eq!(h.rndis.deep_teardowns(), 1);
}

#[tokio::test]
async fn test_scheduled_deep_reset_on_first_attempt() {
    let h = Harness::new(|c| {
        c.rotation.deep_reset_enabled = true;
        c.rotation.deep_reset_method = DeepResetMethod::ImeiRandomize;
        c.rotation.deep_reset_from_attempt = 1;
    });
    h.ips(&["1.2.3.4", "5.6.7.8"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;

    assert_eq!(outcome.kind, OutcomeKind::Succeeded);
    assert_eq!(h.reset.calls(), vec![DeepResetMethod::ImeiRandomize]);
    assert_eq!(h.rndis.log()[0], "teardown deep_reset=true");
}

#[tokio::test]
async fn test_deep_reset_error_does_not_abort_attempt() {
    let h = Harness::new(|c| {
        c.rotation.deep_reset_enabled = true;
        c.rotation.deep_reset_from_attempt = 1;
    });
    h.reset.fail_with("no registration");
    h.ips(&["1.2.3.4", "5.6.7.8"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;
    assert_eq!(outcome.kind, OutcomeKind::Succeeded);
    assert_eq!(h.rndis.bring_ups(), 1);
}

#[tokio::test]
async fn test_disabled_deep_reset_never_runs() {
    let h = Harness::new(|c| c.rotation.max_attempts = 3);
    h.ips(&["1.2.3.4"]);

    h.orchestrator.rotate(RotationTrigger::Api).await;
    assert!(h.reset.calls().is_empty());
    assert_eq!(h.rndis.deep_teardowns(), 0);
}

// ============================================================================
// Mode resolution and config
// ============================================================================

#[tokio::test]
async fn test_auto_mode_uses_detected_transport() {
    let h = Harness::new(|c| c.modem.mode = ModePreference::Auto);
    h.ips(&["1.2.3.4", "5.6.7.8"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;
    assert_eq!(outcome.response.mode, Some(ConnectivityMode::Rndis));
    assert_eq!(h.rndis.bring_ups(), 1);
    assert_eq!(h.ppp.bring_ups(), 0);
}

#[tokio::test]
async fn test_auto_mode_without_interface_falls_back_to_ppp() {
    let h = Harness::new(|c| c.modem.mode = ModePreference::Auto);
    h.probe.set(ConnectivityMode::Rndis, Detection::absent());
    h.ips(&["1.2.3.4", "5.6.7.8"]);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;
    assert_eq!(outcome.response.mode, Some(ConnectivityMode::Ppp));
    assert_eq!(h.ppp.bring_ups(), 1);
    assert_eq!(h.rndis.bring_ups(), 0);
}

#[tokio::test]
async fn test_config_is_reread_every_rotation() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4"]);
    let first = h.orchestrator.rotate(RotationTrigger::Api).await;
    assert_eq!(first.response.attempts, 1);

    let mut edited = common::test_config(h.dir.path());
    edited.rotation.max_attempts = 3;
    h.config.replace(edited);

    let second = h.orchestrator.rotate(RotationTrigger::Api).await;
    assert_eq!(second.response.attempts, 3);
}

#[tokio::test]
async fn test_smart_refresh_follows_current_config() {
    let h = Harness::new(|c| c.rotation.rndis_smart_refresh = true);
    h.ips(&["1.2.3.4", "5.6.7.8", "9.9.9.9"]);

    h.orchestrator.rotate(RotationTrigger::Api).await;
    let plan = h.rndis.last_teardown().unwrap();
    assert!(plan.smart_refresh);
    assert!(!plan.deep_reset);

    let mut edited = common::test_config(h.dir.path());
    edited.rotation.rndis_smart_refresh = false;
    h.config.replace(edited);

    h.orchestrator.rotate(RotationTrigger::Api).await;
    assert!(!h.rndis.last_teardown().unwrap().smart_refresh);
}

// ============================================================================
// Mutual exclusion and lock liberation
// ============================================================================

#[tokio::test]
async fn test_busy_while_rotating_has_no_side_effects() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "5.6.7.8"]);
    let gate = h.rndis.hold();

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.rotate(RotationTrigger::Api).await });
    let rndis = h.rndis.clone();
    wait_until(|| rndis.bring_ups() == 1).await;

    assert!(h.orchestrator.state().is_rotating());
    assert_eq!(h.orchestrator.state().phase(), RotationPhase::BringingUp);

    let history_before = h.history.snapshot().await;
    let ip_calls = h.ip.calls();

    let second = h.orchestrator.rotate(RotationTrigger::Schedule).await;
    assert_eq!(second.kind, OutcomeKind::Busy);
    assert_eq!(second.response.status, RotateStatus::Busy);
    assert_eq!(h.ip.calls(), ip_calls);
    assert_eq!(h.rndis.teardowns(), 1);
    assert_eq!(h.history.snapshot().await, history_before);
    assert!(h.notifier.sent().is_empty());

    gate.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.kind, OutcomeKind::Succeeded);
    assert_eq!(first.response.public_ip.as_deref(), Some("5.6.7.8"));

    assert!(!h.orchestrator.state().is_rotating());
    assert_eq!(h.orchestrator.state().phase(), RotationPhase::Idle);
}

#[tokio::test]
async fn test_status_during_rotation_uses_history() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "5.6.7.8"]);
    let gate = h.rndis.hold();

    let orchestrator = h.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.rotate(RotationTrigger::Api).await });
    let rndis = h.rndis.clone();
    wait_until(|| rndis.bring_ups() == 1).await;

    let probe_calls = h.probe.calls();
    let status = h.orchestrator.status().await;
    assert!(status.rotating);
    assert_eq!(status.public_ip.as_deref(), Some("1.2.3.4"));
    assert_eq!(h.probe.calls(), probe_calls);

    gate.notify_one();
    task.await.unwrap();
}

#[tokio::test]
async fn test_lock_released_after_driver_panic() {
    let h = Harness::new(|_| {});
    h.ips(&["1.2.3.4", "1.2.3.4", "5.6.7.8"]);
    h.rndis.on_bring_up(|n| {
        if n == 1 {
            panic!("driver exploded");
        }
    });

    let orchestrator = h.orchestrator.clone();
    let crashed = tokio::spawn(async move { orchestrator.rotate(RotationTrigger::Api).await }).await;
    assert!(crashed.is_err());
    assert!(!h.orchestrator.state().is_rotating());
    assert_eq!(h.orchestrator.state().phase(), RotationPhase::Idle);

    let outcome = h.orchestrator.rotate(RotationTrigger::Api).await;
    assert_eq!(outcome.kind, OutcomeKind::Succeeded);
}

#[tokio::test]
async fn test_lock_released_after_every_outcome() {
    let h = Harness::new(|_| {});

    h.ips(&["1.2.3.4"]);
    h.orchestrator.rotate(RotationTrigger::Api).await;
    assert!(h.orchestrator.state().try_acquire().is_some());

    h.rndis.script(vec![FakeBringUp::Fail("boom".to_string())]);
    h.orchestrator.rotate(RotationTrigger::Api).await;
    assert!(h.orchestrator.state().try_acquire().is_some());

    h.rndis.script(vec![FakeBringUp::Ok("usb0".to_string())]);
    h.ips(&["1.2.3.4", "5.6.7.8"]);
    h.orchestrator.rotate(RotationTrigger::Api).await;
    assert!(h.orchestrator.state().try_acquire().is_some());
}

// ============================================================================
// History bounds
// ============================================================================

#[tokio::test]
async fn test_history_is_bounded_fifo() {
    let h = Harness::new(|_| {});
    let ips: Vec<String> = (1..=14).map(|i| format!("5.6.7.{}", i)).collect();
    let sequence: Vec<&str> = ips.iter().map(String::as_str).collect();
    h.ips(&sequence);

    // each rotation observes twice: the starting IP and the new one
    for _ in 0..7 {
        let outcome = h.orchestrator.rotate(RotationTrigger::Schedule).await;
        assert_eq!(outcome.kind, OutcomeKind::Succeeded);
    }

    let history = h.history.snapshot().await;
    assert_eq!(history.ips.len(), rotor_common::HISTORY_CAP);
    assert_eq!(history.ips.first().unwrap().ip, "5.6.7.5");
    assert_eq!(history.last_ip(), Some("5.6.7.14"));
    assert_eq!(history.rotations, 13);
}
