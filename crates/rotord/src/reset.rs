//! Deep reset - modem-level escalation when a transport bounce keeps the IP.
//!
//! Always called with the transport already torn down. Every method ends
//! with the modem registered on the network (or an error saying it isn't).

use crate::error::ModemError;
use crate::modem::imei::{self, ImeiVault};
use crate::modem::AtPort;
use crate::shell::CommandRunner;
use crate::wait::{poll_until, sleep_or_cancel};
use async_trait::async_trait;
use rotor_common::DeepResetMethod;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RADIO_OFF_PAUSE: Duration = Duration::from_secs(2);
const REGISTRATION_POLL: Duration = Duration::from_secs(2);
const REENUMERATION_TIMEOUT: Duration = Duration::from_secs(90);
const MODEM_MANAGER: &str = "ModemManager";

#[async_trait]
pub trait DeepReset: Send + Sync {
    /// Run `method`; `wait` bounds re-registration
    async fn reset(&self, method: DeepResetMethod, wait: Duration) -> Result<(), ModemError>;
}

/// Registration state from `+CREG` / `+CGREG` / `+CEREG`: home (1) or roaming (5)
pub(crate) fn is_registered(response: &str) -> bool {
    response.lines().any(|line| {
        let line = line.trim();
        let Some((prefix, rest)) = line.split_once(':') else {
            return false;
        };
        if !matches!(prefix, "+CREG" | "+CGREG" | "+CEREG") {
            return false;
        }
        let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        // query form is "<n>,<stat>", unsolicited form is "<stat>"
        let stat = if fields.len() >= 2 { fields[1] } else { fields[0] };
        stat == "1" || stat == "5"
    })
}

/// AT/ModemManager-backed deep reset
pub struct ModemReset {
    at: Arc<dyn AtPort>,
    runner: Arc<dyn CommandRunner>,
    vault: ImeiVault,
    at_timeout: Duration,
    command_timeout: Duration,
    cancel: CancellationToken,
}

impl ModemReset {
    pub fn new(
        at: Arc<dyn AtPort>,
        runner: Arc<dyn CommandRunner>,
        vault: ImeiVault,
        at_timeout: Duration,
        command_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            at,
            runner,
            vault,
            at_timeout,
            command_timeout,
            cancel,
        }
    }

    async fn soft(&self, command: &str) {
        if let Err(e) = self.at.send(command, self.at_timeout).await {
            warn!("  {} failed: {}", command, e);
        }
    }

    async fn wait_registered(&self, wait: Duration) -> Result<(), ModemError> {
        let at = self.at.clone();
        let timeout = self.at_timeout;
        let outcome = poll_until(wait, REGISTRATION_POLL, &self.cancel, || {
            let at = at.clone();
            async move {
                for query in ["AT+CEREG?", "AT+CGREG?"] {
                    if let Ok(response) = at.send(query, timeout).await {
                        if is_registered(&response) {
                            return true;
                        }
                    }
                }
                false
            }
        })
        .await;

        if outcome.is_ready() {
            Ok(())
        } else {
            Err(ModemError::NotReady(format!(
                "not registered within {}s",
                wait.as_secs()
            )))
        }
    }

    /// Detach, radio off/on, wait for registration, reattach, reactivate PDP
    async fn radio_cycle(&self, wait: Duration) -> Result<(), ModemError> {
        info!("  Deep reset: radio cycle");
        self.soft("AT+CGATT=0").await;
        self.at.send("AT+CFUN=0", self.at_timeout).await?;
        sleep_or_cancel(RADIO_OFF_PAUSE, &self.cancel).await;
        self.at.send("AT+CFUN=1", self.at_timeout).await?;

        self.wait_registered(wait).await?;
        self.soft("AT+CGATT=1").await;
        self.soft("AT+CGACT=1,1").await;
        info!("  Modem re-registered");
        Ok(())
    }

    /// New IMEI + module reboot; a rejected identity change falls through to a radio cycle
    async fn imei_randomize(&self, wait: Duration) -> Result<(), ModemError> {
        info!("  Deep reset: IMEI randomization");
        let current = imei::read_imei(self.at.as_ref(), self.at_timeout).await.ok();
        if let Some(current) = &current {
            if let Err(e) = self.vault.remember(current) {
                warn!("  Could not persist original IMEI: {}", e);
            }
        }

        let original = self.vault.original().or(current);
        let new_imei = imei::generate_imei(original.as_deref(), &mut rand::thread_rng());

        match imei::write_imei(self.at.as_ref(), &new_imei, self.at_timeout).await {
            Ok(()) => {}
            Err(ModemError::Rejected { response, .. }) => {
                warn!("  Modem rejected identity change ({}), using radio cycle", response);
                return self.radio_cycle(wait).await;
            }
            Err(e) => {
                warn!("  Identity change failed ({}), using radio cycle", e);
                return self.radio_cycle(wait).await;
            }
        }

        info!("  IMEI changed, rebooting module");
        // the port drops mid-reply on reboot
        self.soft("AT+CFUN=1,1").await;
        sleep_or_cancel(Duration::from_secs(5), &self.cancel).await;

        let at = self.at.clone();
        let timeout = self.at_timeout;
        let back = poll_until(REENUMERATION_TIMEOUT, Duration::from_secs(3), &self.cancel, || {
            let at = at.clone();
            async move { at.send("AT", timeout).await.is_ok() }
        })
        .await;
        if !back.is_ready() {
            return Err(ModemError::NotReady("modem did not re-enumerate".to_string()));
        }

        self.wait_registered(wait).await
    }

    /// ModemManager disable/enable, then stop it so the AT port is ours again
    async fn service_reset(&self, wait: Duration) -> Result<(), ModemError> {
        if !self.runner.exists("mmcli") {
            warn!("  mmcli not installed, using radio cycle");
            return self.radio_cycle(wait).await;
        }

        info!("  Deep reset: {} disable/enable", MODEM_MANAGER);
        let t = self.command_timeout;
        self.runner
            .run_checked("systemctl", &["start", MODEM_MANAGER], t)
            .await?;
        sleep_or_cancel(Duration::from_secs(5), &self.cancel).await;

        let result = async {
            self.runner
                .run_checked("mmcli", &["-m", "any", "--disable"], t)
                .await?;
            self.runner
                .run_checked("mmcli", &["-m", "any", "--enable"], t)
                .await?;
            Ok::<(), ModemError>(())
        }
        .await;

        // always hand the serial port back
        if let Err(e) = self
            .runner
            .run_checked("systemctl", &["stop", MODEM_MANAGER], t)
            .await
        {
            warn!("  Could not stop {}: {}", MODEM_MANAGER, e);
        }
        result?;

        self.wait_registered(wait).await
    }
}

#[async_trait]
impl DeepReset for ModemReset {
    async fn reset(&self, method: DeepResetMethod, wait: Duration) -> Result<(), ModemError> {
        match method {
            DeepResetMethod::None => Ok(()),
            DeepResetMethod::RadioCycle => self.radio_cycle(wait).await,
            DeepResetMethod::ImeiRandomize => self.imei_randomize(wait).await,
            DeepResetMethod::ServiceReset => self.service_reset(wait).await,
        }
    }
}

// ============================================================================
// Fake deep reset (testing)
// ============================================================================

#[derive(Clone, Default)]
pub struct FakeDeepReset {
    calls: Arc<Mutex<Vec<DeepResetMethod>>>,
    fail: Arc<Mutex<Option<String>>>,
}

impl FakeDeepReset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: &str) -> &Self {
        if let Ok(mut f) = self.fail.lock() {
            *f = Some(message.to_string());
        }
        self
    }

    pub fn calls(&self) -> Vec<DeepResetMethod> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeepReset for FakeDeepReset {
    async fn reset(&self, method: DeepResetMethod, _wait: Duration) -> Result<(), ModemError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(method);
        }
        match self.fail.lock().ok().and_then(|f| f.clone()) {
            Some(message) => Err(ModemError::NotReady(message)),
            None => Ok(()),
        }
    }
}
