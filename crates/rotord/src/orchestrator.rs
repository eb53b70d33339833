//! Rotation orchestrator.
//!
//! `Idle -> Probing -> TearingDown -> (DeepResetting) -> BringingUp ->
//! Verifying -> {Succeeded, Failed} -> Idle`
//!
//! One rotation at a time. A second request while one is in flight gets
//! `Busy` straight away with no side effects; nothing queues. The lock is
//! an owned guard, so every exit path releases it, panics included.
//!
//! Every driver, probe and reset error is folded into the attempt log.
//! Callers only ever see a [`RotationOutcome`].

use crate::config::ConfigSource;
use crate::drivers::{DriverSet, Teardown, TransportDriver};
use crate::history::HistoryStore;
use crate::notifier::{Notification, NotificationKind, NotificationSink};
use crate::probe::InterfaceProbe;
use crate::reset::DeepReset;
use crate::routing::{DefaultRoute, RouteGuard};
use crate::verify::{ObservedIp, PublicIpSource};
use crate::wait::sleep_or_cancel;
use rotor_common::{
    ConnectivityMode, RotateResponse, RotateStatus, RotationAttemptResult, RotationConfig,
    RotationPhase, StatusResponse, VERSION,
};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Who asked for the rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    Api,
    Schedule,
}

impl fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationTrigger::Api => f.write_str("api"),
            RotationTrigger::Schedule => f.write_str("schedule"),
        }
    }
}

/// Result class, drives the HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Succeeded,
    Busy,
    /// Same, private or unknown IP after every attempt
    LogicalFailure,
    /// Last attempt could not bring the transport up
    DriverFailure,
}

#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub kind: OutcomeKind,
    pub response: RotateResponse,
}

impl RotationOutcome {
    fn busy() -> Self {
        Self {
            kind: OutcomeKind::Busy,
            response: RotateResponse::busy(),
        }
    }
}

// ============================================================================
// Lock + phase
// ============================================================================

/// Shared rotation state: the exclusive lock and the current phase
#[derive(Clone, Default)]
pub struct OrchestratorState {
    lock: Arc<Mutex<()>>,
    phase: Arc<RwLock<RotationPhase>>,
}

impl OrchestratorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking acquire
    pub fn try_acquire(&self) -> Option<RotationGuard> {
        let lock = self.lock.clone().try_lock_owned().ok()?;
        Some(RotationGuard {
            _lock: lock,
            phase: self.phase.clone(),
        })
    }

    pub fn is_rotating(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn phase(&self) -> RotationPhase {
        self.phase.read().map(|p| *p).unwrap_or_default()
    }
}

/// Held for the whole rotation; dropping it resets the phase and releases the lock
pub struct RotationGuard {
    _lock: OwnedMutexGuard<()>,
    phase: Arc<RwLock<RotationPhase>>,
}

impl RotationGuard {
    pub fn set_phase(&self, phase: RotationPhase) {
        if let Ok(mut p) = self.phase.write() {
            *p = phase;
        }
    }
}

impl Drop for RotationGuard {
    fn drop(&mut self) {
        // runs before the lock field drops
        if let Ok(mut p) = self.phase.write() {
            *p = RotationPhase::Idle;
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Everything the orchestrator talks to
pub struct Collaborators {
    pub config: Arc<dyn ConfigSource>,
    pub probe: Arc<dyn InterfaceProbe>,
    pub drivers: DriverSet,
    pub reset: Arc<dyn DeepReset>,
    pub routes: Arc<dyn RouteGuard>,
    pub ip_source: Arc<dyn PublicIpSource>,
    pub history: Arc<HistoryStore>,
    pub notifier: Arc<dyn NotificationSink>,
}

enum Verdict {
    Changed(String),
    SameIp(String),
    Private(String),
    Unknown,
    Driver(String),
}

impl Verdict {
    fn error(&self) -> Option<String> {
        match self {
            Verdict::Changed(_) => None,
            Verdict::SameIp(ip) => Some(format!("IP unchanged ({})", ip)),
            Verdict::Private(ip) => Some(format!(
                "Proxy egress is private address {} - cellular routing broken, falling back to LAN",
                ip
            )),
            Verdict::Unknown => Some("Public IP unknown after rotation".to_string()),
            Verdict::Driver(message) => Some(message.clone()),
        }
    }
}

pub struct Orchestrator {
    parts: Collaborators,
    state: OrchestratorState,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(parts: Collaborators, state: OrchestratorState, cancel: CancellationToken) -> Self {
        Self {
            parts,
            state,
            cancel,
        }
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn config(&self) -> &Arc<dyn ConfigSource> {
        &self.parts.config
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.parts.history
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationSink> {
        &self.parts.notifier
    }

    /// Explicit preference, else the auto-detected transport, else PPP
    async fn resolve_mode(&self, rotation: &RotationConfig) -> (ConnectivityMode, Option<String>) {
        if let Some(mode) = rotation.mode_preference.forced() {
            let detection = self.parts.probe.detect(mode).await;
            return (mode, detection.interface);
        }
        match self.parts.probe.detect_active().await {
            (ConnectivityMode::None, _) => {
                warn!("[ROTATE] No cellular interface detected, falling back to PPP");
                (ConnectivityMode::Ppp, None)
            }
            (mode, detection) => (mode, detection.interface),
        }
    }

    /// Fast status: interface checks and one IP lookup, never AT commands.
    /// While rotating, answers from the last history entry.
    pub async fn status(&self) -> StatusResponse {
        let rotating = self.state.is_rotating();
        let phase = self.state.phase();

        if rotating {
            let history = self.parts.history.snapshot().await;
            return StatusResponse {
                public_ip: history.last_ip().map(str::to_string),
                connection_mode: ConnectivityMode::None,
                interface: None,
                connected: false,
                rotating,
                phase,
                version: VERSION.to_string(),
            };
        }

        let (mode, detection) = self.parts.probe.detect_active().await;
        let public_ip = if detection.has_ip() {
            self.parts.ip_source.observe().await.public().map(|ip| ip.to_string())
        } else {
            None
        };

        StatusResponse {
            connected: detection.has_ip() && public_ip.is_some(),
            public_ip,
            connection_mode: mode,
            interface: detection.interface,
            rotating,
            phase,
            version: VERSION.to_string(),
        }
    }

    /// Current public IP through the proxy, for manual notifications
    pub async fn current_ip(&self) -> (Option<String>, ConnectivityMode) {
        let (mode, _) = self.parts.probe.detect_active().await;
        (self.parts.ip_source.observe().await.address(), mode)
    }

    /// Run one full rotation. Returns `Busy` immediately if one is running.
    pub async fn rotate(&self, trigger: RotationTrigger) -> RotationOutcome {
        let Some(guard) = self.state.try_acquire() else {
            info!("[ROTATE] Rejected {} request: rotation already in progress", trigger);
            return RotationOutcome::busy();
        };

        info!("[ROTATE] Rotation started (trigger: {})", trigger);
        let outcome = self.run(&guard).await;
        match outcome.kind {
            OutcomeKind::Succeeded => info!(
                "[ROTATE] Succeeded after {} attempt(s): {} -> {}",
                outcome.response.attempts,
                outcome.response.previous_ip.as_deref().unwrap_or("unknown"),
                outcome.response.public_ip.as_deref().unwrap_or("unknown"),
            ),
            _ => error!(
                "[ROTATE] Failed after {} attempt(s): {}",
                outcome.response.attempts,
                outcome.response.error.as_deref().unwrap_or("unknown error"),
            ),
        }
        outcome
    }

    async fn run(&self, guard: &RotationGuard) -> RotationOutcome {
        let rotation = self.parts.config.current().rotation_config();

        guard.set_phase(RotationPhase::Probing);
        let previous = self.parts.ip_source.observe().await;
        let previous_ip = previous.public().map(|ip| ip.to_string());
        match &previous_ip {
            Some(ip) => {
                if let Err(e) = self.parts.history.record_observed(ip).await {
                    warn!("  Could not record starting IP: {}", e);
                }
            }
            None => warn!("  Starting IP is {}; any new public IP will count", previous),
        }

        let primary = self.parts.routes.capture_primary().await;
        let (mode, interface) = self.resolve_mode(&rotation).await;
        info!(
            "[ROTATE] Mode {} (interface {}), up to {} attempt(s)",
            mode,
            interface.as_deref().unwrap_or("none"),
            rotation.max_attempts
        );

        let Some(driver) = self.parts.drivers.get(mode) else {
            let message = format!("No driver for mode {}", mode);
            return self
                .fail(guard, mode, previous_ip, None, Vec::new(), primary.as_ref(), message, OutcomeKind::DriverFailure)
                .await;
        };

        let mut log: Vec<RotationAttemptResult> = Vec::new();
        let mut escalate = false;
        let mut last_verdict = Verdict::Unknown;

        for attempt in 1..=rotation.max_attempts {
            let deep_reset = rotation.deep_reset_scheduled(attempt)
                || (escalate && rotation.deep_reset_available());
            info!(
                "[ROTATE] Attempt {}/{}{}",
                attempt,
                rotation.max_attempts,
                if deep_reset { " with deep reset" } else { "" }
            );

            let verdict = self
                .attempt(guard, driver.as_ref(), &rotation, deep_reset, previous_ip.as_deref(), primary.as_ref())
                .await;

            let observed_ip = match &verdict {
                Verdict::Changed(ip) | Verdict::SameIp(ip) | Verdict::Private(ip) => Some(ip.clone()),
                Verdict::Unknown | Verdict::Driver(_) => None,
            };
            let error = verdict.error();
            match &error {
                Some(e) => warn!("  Attempt {} failed: {}", attempt, e),
                None => info!("  Attempt {} observed new IP {}", attempt, observed_ip.as_deref().unwrap_or("?")),
            }
            log.push(RotationAttemptResult {
                attempt_number: attempt,
                previous_ip: previous_ip.clone(),
                observed_ip,
                succeeded: error.is_none(),
                deep_reset,
                error,
            });

            if let Verdict::Changed(ip) = &verdict {
                return self.succeed(guard, mode, previous_ip, ip.clone(), log).await;
            }
            escalate = matches!(verdict, Verdict::SameIp(_));
            last_verdict = verdict;
        }

        let kind = match last_verdict {
            Verdict::Driver(_) => OutcomeKind::DriverFailure,
            _ => OutcomeKind::LogicalFailure,
        };
        let last_observed = log.last().and_then(|a| a.observed_ip.clone());
        let message = log
            .last()
            .and_then(|a| a.error.clone())
            .unwrap_or_else(|| "Rotation failed".to_string());
        self.fail(guard, mode, previous_ip, last_observed, log, primary.as_ref(), message, kind)
            .await
    }

    async fn attempt(
        &self,
        guard: &RotationGuard,
        driver: &dyn TransportDriver,
        rotation: &RotationConfig,
        deep_reset: bool,
        previous_ip: Option<&str>,
        primary: Option<&DefaultRoute>,
    ) -> Verdict {
        guard.set_phase(RotationPhase::TearingDown);
        let plan = Teardown {
            wait: Duration::from_secs(rotation.teardown_wait_s),
            deep_reset,
            smart_refresh: rotation.rndis_smart_refresh,
        };
        if let Err(e) = driver.teardown(plan).await {
            // a half-torn-down transport still gets a bring-up
            warn!("  Teardown error: {}", e);
        }

        if deep_reset {
            guard.set_phase(RotationPhase::DeepResetting);
            if let Err(e) = self
                .parts
                .reset
                .reset(rotation.deep_reset_method, Duration::from_secs(rotation.deep_reset_wait_s))
                .await
            {
                warn!("  Deep reset ({}) error: {}", rotation.deep_reset_method, e);
            }
        }

        guard.set_phase(RotationPhase::BringingUp);
        let interface = match driver.bring_up(&rotation.apn).await {
            Ok(interface) => interface,
            Err(e) => return Verdict::Driver(format!("Bring-up failed: {}", e)),
        };

        if !driver.wait_ready(Duration::from_secs(rotation.restart_wait_s)).await {
            return Verdict::Driver(format!(
                "{} not ready within {}s",
                interface, rotation.restart_wait_s
            ));
        }

        if let Err(e) = self.parts.routes.secure(&interface, primary).await {
            warn!("  Routing guard error: {}", e);
        }

        guard.set_phase(RotationPhase::Verifying);
        sleep_or_cancel(Duration::from_secs(rotation.settle_wait_s), &self.cancel).await;

        match self.parts.ip_source.observe().await {
            ObservedIp::Public(ip) => {
                let ip = ip.to_string();
                if let Err(e) = self.parts.history.record_observed(&ip).await {
                    warn!("  Could not record IP: {}", e);
                }
                if previous_ip == Some(ip.as_str()) {
                    Verdict::SameIp(ip)
                } else {
                    Verdict::Changed(ip)
                }
            }
            ObservedIp::Private(ip) => Verdict::Private(ip.to_string()),
            ObservedIp::Unknown => Verdict::Unknown,
        }
    }

    async fn succeed(
        &self,
        guard: &RotationGuard,
        mode: ConnectivityMode,
        previous_ip: Option<String>,
        ip: String,
        log: Vec<RotationAttemptResult>,
    ) -> RotationOutcome {
        guard.set_phase(RotationPhase::Succeeded);
        let attempts = log.len() as u32;

        self.send(Notification {
            kind: NotificationKind::Rotation,
            ip: Some(ip.clone()),
            previous_ip: previous_ip.clone(),
            is_failure: false,
            error: None,
            mode,
            attempts,
        })
        .await;

        RotationOutcome {
            kind: OutcomeKind::Succeeded,
            response: RotateResponse {
                status: RotateStatus::Success,
                public_ip: Some(ip),
                previous_ip,
                attempts,
                error: None,
                mode: Some(mode),
                attempt_log: log,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        guard: &RotationGuard,
        mode: ConnectivityMode,
        previous_ip: Option<String>,
        observed_ip: Option<String>,
        log: Vec<RotationAttemptResult>,
        primary: Option<&DefaultRoute>,
        message: String,
        kind: OutcomeKind,
    ) -> RotationOutcome {
        guard.set_phase(RotationPhase::Failed);
        let attempts = log.len() as u32;

        if let Some(primary) = primary {
            if let Err(e) = self.parts.routes.preserve_primary(primary).await {
                warn!("  Could not re-assert primary route: {}", e);
            }
        }

        let recorded_ip = observed_ip
            .clone()
            .or_else(|| previous_ip.clone())
            .unwrap_or_else(|| "unknown".to_string());
        if let Err(e) = self.parts.history.record_failure(&recorded_ip, &message).await {
            warn!("  Could not record failure: {}", e);
        }

        self.send(Notification {
            kind: NotificationKind::Rotation,
            ip: observed_ip.clone(),
            previous_ip: previous_ip.clone(),
            is_failure: true,
            error: Some(message.clone()),
            mode,
            attempts,
        })
        .await;

        RotationOutcome {
            kind,
            response: RotateResponse {
                status: RotateStatus::Failed,
                public_ip: observed_ip,
                previous_ip,
                attempts,
                error: Some(message),
                mode: Some(mode),
                attempt_log: log,
            },
        }
    }

    async fn send(&self, notification: Notification) {
        if let Err(e) = self.parts.notifier.notify(&notification).await {
            warn!("  Notification failed: {}", e);
        }
    }
}
