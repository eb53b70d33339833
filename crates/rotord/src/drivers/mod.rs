//! Transport drivers - one per cellular transport.
//!
//! Each driver tears its transport down, brings it back up and waits for
//! the interface to hold an IPv4 address. Bring-up failures come back as
//! [`DriverError`] so the orchestrator can tell them apart from a
//! technically healthy bring-up that still produced the same public IP.

pub mod carrier;
pub mod ppp;
pub mod qmi;
pub mod rndis;

use crate::error::DriverError;
use crate::modem::AtPort;
use crate::probe::InterfaceProbe;
use crate::shell::CommandRunner;
use crate::wait::{poll_until, WaitOutcome};
use async_trait::async_trait;
use rotor_common::ConnectivityMode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use ppp::PppDriver;
pub use qmi::QmiDriver;
pub use rndis::RndisDriver;

/// Interval between readiness checks
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Teardown parameters for one attempt, taken from the rotation snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    /// How long the transport stays down
    pub wait: Duration,
    /// A modem-level reset follows, so lightweight refresh tricks are skipped
    pub deep_reset: bool,
    /// RNDIS radio tech + APN cycle before the link bounce
    pub smart_refresh: bool,
}

impl Teardown {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            deep_reset: false,
            smart_refresh: false,
        }
    }
}

#[async_trait]
pub trait TransportDriver: Send + Sync {
    fn mode(&self) -> ConnectivityMode;

    /// Stop the transport and stay down for `plan.wait`
    async fn teardown(&self, plan: Teardown) -> Result<(), DriverError>;

    /// Start the transport; returns the interface name
    async fn bring_up(&self, apn: &str) -> Result<String, DriverError>;

    /// Poll until the interface holds an IPv4 address or `timeout` passes
    async fn wait_ready(&self, timeout: Duration) -> bool;
}

/// Collaborators every driver needs
#[derive(Clone)]
pub struct DriverContext {
    pub runner: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn InterfaceProbe>,
    pub at: Arc<dyn AtPort>,
    pub command_timeout: Duration,
    pub at_timeout: Duration,
    pub dhcp_client: Option<String>,
    pub cancel: CancellationToken,
}

impl DriverContext {
    /// Sleep unless shutting down
    pub async fn pause(&self, wait: Duration) {
        crate::wait::sleep_or_cancel(wait, &self.cancel).await;
    }

    /// Wait for `mode`'s interface to hold an IPv4 address
    pub async fn wait_for_ip(&self, mode: ConnectivityMode, timeout: Duration) -> bool {
        let probe = self.probe.clone();
        let outcome = poll_until(timeout, READY_POLL_INTERVAL, &self.cancel, || {
            let probe = probe.clone();
            async move { probe.detect(mode).await.has_ip() }
        })
        .await;

        match outcome {
            WaitOutcome::Ready => true,
            WaitOutcome::TimedOut => {
                warn!("  {} interface not ready after {:?}", mode, timeout);
                false
            }
            WaitOutcome::Cancelled => false,
        }
    }

    /// Run the DHCP client on `interface`: configured client, else the first
    /// installed of udhcpc, dhclient, dhcpcd.
    pub async fn run_dhcp(&self, interface: &str) -> Result<(), DriverError> {
        let client = match &self.dhcp_client {
            Some(client) => client.clone(),
            None => ["udhcpc", "dhclient", "dhcpcd"]
                .into_iter()
                .find(|c| self.runner.exists(c))
                .map(str::to_string)
                .ok_or_else(|| DriverError::BringUp("no DHCP client installed".to_string()))?,
        };

        let args = dhcp_args(&client, interface);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!("  DHCP on {} via {}", interface, client);
        self.runner
            .run_checked(&client, &args, self.command_timeout)
            .await?;
        Ok(())
    }
}

/// Arguments for a one-shot lease with the given client
pub fn dhcp_args(client: &str, interface: &str) -> Vec<String> {
    let name = client.rsplit('/').next().unwrap_or(client);
    let args: Vec<&str> = match name {
        "udhcpc" => vec!["-q", "-f", "-n", "-i", interface],
        "dhclient" => vec!["-1", "-v", interface],
        "dhcpcd" => vec!["-1", "-4", interface],
        _ => vec![interface],
    };
    args.into_iter().map(str::to_string).collect()
}

/// Drivers keyed by mode
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: HashMap<ConnectivityMode, Arc<dyn TransportDriver>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, driver: Arc<dyn TransportDriver>) -> Self {
        self.drivers.insert(driver.mode(), driver);
        self
    }

    pub fn get(&self, mode: ConnectivityMode) -> Option<Arc<dyn TransportDriver>> {
        self.drivers.get(&mode).cloned()
    }

    /// The three real drivers
    pub fn standard(ctx: DriverContext, qmi: qmi::QmiSettings, ppp: ppp::PppSettings) -> Self {
        Self::new()
            .with(Arc::new(QmiDriver::new(ctx.clone(), qmi)))
            .with(Arc::new(RndisDriver::new(ctx.clone())))
            .with(Arc::new(PppDriver::new(ctx, ppp)))
    }
}

// ============================================================================
// Fake driver (testing)
// ============================================================================

/// What a fake bring-up does
#[derive(Debug, Clone)]
pub enum FakeBringUp {
    Ok(String),
    Fail(String),
}

/// Scripted driver. Bring-up outcomes are consumed in order, the last one
/// repeats. `on_bring_up` lets a test flip fake probe/IP state at the moment
/// the transport would come back.
#[derive(Clone)]
pub struct FakeDriver {
    mode: ConnectivityMode,
    outcomes: Arc<Mutex<Vec<FakeBringUp>>>,
    ready: Arc<Mutex<bool>>,
    on_bring_up: Arc<Mutex<Option<Box<dyn Fn(u32) + Send + Sync>>>>,
    gate: Arc<Mutex<Option<Arc<Notify>>>>,
    teardowns: Arc<AtomicU32>,
    deep_teardowns: Arc<AtomicU32>,
    last_teardown: Arc<Mutex<Option<Teardown>>>,
    bring_ups: Arc<AtomicU32>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeDriver {
    pub fn new(mode: ConnectivityMode) -> Self {
        Self {
            mode,
            outcomes: Arc::new(Mutex::new(vec![FakeBringUp::Ok(fake_interface(mode))])),
            ready: Arc::new(Mutex::new(true)),
            on_bring_up: Arc::new(Mutex::new(None)),
            gate: Arc::new(Mutex::new(None)),
            teardowns: Arc::new(AtomicU32::new(0)),
            deep_teardowns: Arc::new(AtomicU32::new(0)),
            last_teardown: Arc::new(Mutex::new(None)),
            bring_ups: Arc::new(AtomicU32::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn script(&self, outcomes: Vec<FakeBringUp>) -> &Self {
        if let Ok(mut o) = self.outcomes.lock() {
            *o = outcomes;
        }
        self
    }

    pub fn set_ready(&self, ready: bool) -> &Self {
        if let Ok(mut r) = self.ready.lock() {
            *r = ready;
        }
        self
    }

    /// Callback invoked with the 1-based bring-up count on every bring-up
    pub fn on_bring_up(&self, hook: impl Fn(u32) + Send + Sync + 'static) -> &Self {
        if let Ok(mut h) = self.on_bring_up.lock() {
            *h = Some(Box::new(hook));
        }
        self
    }

    /// Make every bring-up wait for a notification on the returned handle
    pub fn hold(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        if let Ok(mut gate) = self.gate.lock() {
            *gate = Some(notify.clone());
        }
        notify
    }

    pub fn teardowns(&self) -> u32 {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn deep_teardowns(&self) -> u32 {
        self.deep_teardowns.load(Ordering::SeqCst)
    }

    pub fn last_teardown(&self) -> Option<Teardown> {
        self.last_teardown.lock().ok().and_then(|t| *t)
    }

    pub fn bring_ups(&self) -> u32 {
        self.bring_ups.load(Ordering::SeqCst)
    }

    /// Ordered record of driver calls
    pub fn log(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn note(&self, entry: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
    }
}

fn fake_interface(mode: ConnectivityMode) -> String {
    match mode {
        ConnectivityMode::Qmi => "wwan0",
        ConnectivityMode::Rndis => "usb0",
        ConnectivityMode::Ppp => "ppp0",
        ConnectivityMode::None => "none",
    }
    .to_string()
}

#[async_trait]
impl TransportDriver for FakeDriver {
    fn mode(&self) -> ConnectivityMode {
        self.mode
    }

    async fn teardown(&self, plan: Teardown) -> Result<(), DriverError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if plan.deep_reset {
            self.deep_teardowns.fetch_add(1, Ordering::SeqCst);
        }
        if let Ok(mut last) = self.last_teardown.lock() {
            *last = Some(plan);
        }
        self.note(format!("teardown deep_reset={}", plan.deep_reset));
        Ok(())
    }

    async fn bring_up(&self, apn: &str) -> Result<String, DriverError> {
        let n = self.bring_ups.fetch_add(1, Ordering::SeqCst) + 1;
        self.note(format!("bring_up apn={}", apn));

        let gate = self.gate.lock().ok().and_then(|g| g.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let outcome = self.outcomes.lock().ok().and_then(|mut outcomes| {
            if outcomes.len() > 1 {
                Some(outcomes.remove(0))
            } else {
                outcomes.first().cloned()
            }
        });

        if let Ok(hook) = self.on_bring_up.lock() {
            if let Some(hook) = hook.as_ref() {
                hook(n);
            }
        }

        match outcome {
            Some(FakeBringUp::Fail(message)) => Err(DriverError::BringUp(message)),
            Some(FakeBringUp::Ok(interface)) => Ok(interface),
            None => Ok(fake_interface(self.mode)),
        }
    }

    async fn wait_ready(&self, _timeout: Duration) -> bool {
        self.ready.lock().map(|r| *r).unwrap_or(false)
    }
}

/// Log line shared by the real drivers
pub(crate) fn log_step(mode: ConnectivityMode, step: &str) {
    info!("  [{}] {}", mode, step);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dhcp_args() {
        assert_eq!(dhcp_args("udhcpc", "wwan0"), vec!["-q", "-f", "-n", "-i", "wwan0"]);
        assert_eq!(dhcp_args("/sbin/dhclient", "usb0"), vec!["-1", "-v", "usb0"]);
        assert_eq!(dhcp_args("custom-dhcp", "usb0"), vec!["usb0"]);
    }

    #[tokio::test]
    async fn test_fake_driver_script_repeats_last() {
        let driver = FakeDriver::new(ConnectivityMode::Rndis);
        driver.script(vec![
            FakeBringUp::Fail("modem busy".to_string()),
            FakeBringUp::Ok("usb0".to_string()),
        ]);

        assert!(driver.bring_up("internet").await.is_err());
        assert_eq!(driver.bring_up("internet").await.unwrap(), "usb0");
        assert_eq!(driver.bring_up("internet").await.unwrap(), "usb0");
        assert_eq!(driver.bring_ups(), 3);
    }

    #[test]
    fn test_driver_set_lookup() {
        let set = DriverSet::new().with(Arc::new(FakeDriver::new(ConnectivityMode::Ppp)));
        assert!(set.get(ConnectivityMode::Ppp).is_some());
        assert!(set.get(ConnectivityMode::Qmi).is_none());
    }
}
