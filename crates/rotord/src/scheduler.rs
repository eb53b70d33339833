//! Auto-rotation timer.
//!
//! One background task sleeps `pm2.ip_rotation_interval` seconds and then
//! asks the orchestrator for a rotation, exactly like an API caller would.
//! A busy orchestrator just means this cycle is skipped. The interval is
//! re-read from config every cycle.

use crate::orchestrator::{OutcomeKind, Orchestrator, RotationTrigger};
use crate::wait::sleep_or_cancel;
use chrono::{DateTime, Utc};
use rotor_common::AutoRotationStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shortest interval the timer accepts
pub const MIN_INTERVAL_S: u64 = 60;

/// Pause after a rotation task crashed
pub const RETRY_PAUSE: Duration = Duration::from_secs(60);

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

pub struct AutoRotation {
    orchestrator: Arc<Orchestrator>,
    enabled: AtomicBool,
    interval_s: AtomicU64,
    next_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    running: Mutex<Option<Running>>,
    shutdown: CancellationToken,
}

/// Clears the alive flag however the loop exits
struct AliveFlag(Arc<AtomicBool>);

impl Drop for AliveFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AutoRotation {
    pub fn new(orchestrator: Arc<Orchestrator>, shutdown: CancellationToken) -> Arc<Self> {
        let interval = configured_interval(&orchestrator);
        Arc::new(Self {
            orchestrator,
            enabled: AtomicBool::new(false),
            interval_s: AtomicU64::new(interval),
            next_at: Arc::new(RwLock::new(None)),
            running: Mutex::new(None),
            shutdown,
        })
    }

    /// Start the timer if the config asks for it
    pub fn start_from_config(self: &Arc<Self>) {
        if self.orchestrator.config().current().pm2.enabled {
            self.enable();
        } else {
            info!("[AUTO] Auto-rotation disabled in config");
        }
    }

    /// Turn the timer on; a live loop is left alone
    pub fn enable(self: &Arc<Self>) -> AutoRotationStatus {
        self.enabled.store(true, Ordering::SeqCst);
        if !self.is_alive() {
            self.stop();
            self.spawn();
        }
        self.status()
    }

    /// Turn the timer off. A rotation already running finishes normally.
    pub fn disable(&self) -> AutoRotationStatus {
        self.enabled.store(false, Ordering::SeqCst);
        self.stop();
        info!("[AUTO] Auto-rotation disabled");
        self.status()
    }

    /// Fresh loop with the current interval
    pub fn restart(self: &Arc<Self>) -> AutoRotationStatus {
        self.enabled.store(true, Ordering::SeqCst);
        self.stop();
        self.spawn();
        self.status()
    }

    pub fn status(&self) -> AutoRotationStatus {
        AutoRotationStatus {
            enabled: self.enabled.load(Ordering::SeqCst),
            interval_s: self.interval_s.load(Ordering::SeqCst),
            thread_alive: self.is_alive(),
            next_rotation_at: self.next_at.read().ok().and_then(|n| *n),
            phase: self.orchestrator.state().phase(),
        }
    }

    fn is_alive(&self) -> bool {
        self.running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.alive.load(Ordering::SeqCst)))
            .unwrap_or(false)
    }

    fn stop(&self) {
        let previous = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(running) = previous {
            running.cancel.cancel();
            // the loop may be awaiting a rotation; let it finish on its own
            drop(running.handle);
        }
        set_next(&self.next_at, None);
    }

    fn spawn(self: &Arc<Self>) {
        let cancel = self.shutdown.child_token();
        let alive = Arc::new(AtomicBool::new(true));

        let this = self.clone();
        let token = cancel.clone();
        let flag = AliveFlag(alive.clone());
        let handle = tokio::spawn(async move { this.run(token, flag).await });

        if let Ok(mut running) = self.running.lock() {
            *running = Some(Running {
                cancel,
                handle,
                alive,
            });
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken, _alive: AliveFlag) {
        info!(
            "[AUTO] Auto-rotation started (every {}s)",
            configured_interval(&self.orchestrator)
        );

        let mut retry_after_crash = false;
        loop {
            let interval = configured_interval(&self.orchestrator);
            self.interval_s.store(interval, Ordering::SeqCst);
            let wait = if retry_after_crash {
                RETRY_PAUSE
            } else {
                Duration::from_secs(interval)
            };
            retry_after_crash = false;

            let next = Utc::now() + chrono::Duration::seconds(wait.as_secs() as i64);
            set_next(&self.next_at, Some(next));
            if !sleep_or_cancel(wait, &cancel).await {
                break;
            }
            set_next(&self.next_at, None);

            let orchestrator = self.orchestrator.clone();
            let task =
                tokio::spawn(async move { orchestrator.rotate(RotationTrigger::Schedule).await });
            match task.await {
                Ok(outcome) => match outcome.kind {
                    OutcomeKind::Succeeded => info!(
                        "[AUTO] Scheduled rotation done: {}",
                        outcome.response.public_ip.as_deref().unwrap_or("unknown")
                    ),
                    OutcomeKind::Busy => {
                        info!("[AUTO] Rotation already in progress, skipping this cycle")
                    }
                    _ => warn!("[AUTO] Scheduled rotation failed, will retry next cycle"),
                },
                Err(e) => {
                    error!("[AUTO] Rotation task crashed: {}", e);
                    retry_after_crash = true;
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }
        info!("[AUTO] Auto-rotation loop stopped");
    }
}

fn configured_interval(orchestrator: &Orchestrator) -> u64 {
    let interval = orchestrator.config().current().pm2.ip_rotation_interval;
    if interval < MIN_INTERVAL_S {
        warn!(
            "[AUTO] ip_rotation_interval {}s is below {}s, using {}s",
            interval, MIN_INTERVAL_S, MIN_INTERVAL_S
        );
        return MIN_INTERVAL_S;
    }
    interval
}

fn set_next(slot: &RwLock<Option<DateTime<Utc>>>, value: Option<DateTime<Utc>>) {
    if let Ok(mut next) = slot.write() {
        *next = value;
    }
}
