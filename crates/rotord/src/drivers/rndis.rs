//! RNDIS/ECM transport (`enx*`, `eth1`, `usb0`).
//!
//! The modem firmware owns the carrier session, so the host side is just
//! link down/up plus DHCP. The optional smart refresh drops the radio to
//! 3G and back and re-writes the PDP context APN, which often earns a new
//! lease without a full radio reset.

use super::{log_step, DriverContext, Teardown, TransportDriver};
use crate::error::DriverError;
use async_trait::async_trait;
use rotor_common::ConnectivityMode;
use std::time::Duration;
use tracing::warn;

const DEFAULT_INTERFACE: &str = "usb0";
/// `AT+CNMP` preferred modes
const CNMP_WCDMA: &str = "14";
const CNMP_LTE: &str = "38";
const REFRESH_PAUSE: Duration = Duration::from_secs(3);

pub struct RndisDriver {
    ctx: DriverContext,
}

impl RndisDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }

    async fn interface(&self) -> String {
        self.ctx
            .probe
            .detect(ConnectivityMode::Rndis)
            .await
            .interface
            .unwrap_or_else(|| DEFAULT_INTERFACE.to_string())
    }

    async fn at(&self, command: &str) -> bool {
        match self.ctx.at.send(command, self.ctx.at_timeout).await {
            Ok(_) => true,
            Err(e) => {
                warn!("  {} failed: {}", command, e);
                false
            }
        }
    }

    /// 4G -> 3G -> 4G and re-write the PDP context. AT failures are logged
    /// and skipped; the link bounce still runs.
    async fn smart_refresh(&self) {
        log_step(self.mode(), "Smart refresh (radio tech + APN cycle)");

        let apn = match self.ctx.at.send("AT+CGDCONT?", self.ctx.at_timeout).await {
            Ok(response) => parse_context_apn(&response),
            Err(e) => {
                warn!("  Could not read PDP context: {}", e);
                None
            }
        };

        self.at(&format!("AT+CNMP={}", CNMP_WCDMA)).await;
        self.ctx.pause(REFRESH_PAUSE).await;
        self.at(&format!("AT+CNMP={}", CNMP_LTE)).await;

        if let Some(apn) = apn {
            self.at("AT+CGDCONT=1,\"IP\",\"\"").await;
            self.at(&format!("AT+CGDCONT=1,\"IP\",\"{}\"", apn)).await;
        }
    }
}

/// APN of context 1 in an `AT+CGDCONT?` response
pub(crate) fn parse_context_apn(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("+CGDCONT:")?;
        let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        if fields.first() != Some(&"1") {
            return None;
        }
        let apn = fields.get(2)?.trim_matches('"');
        if apn.is_empty() {
            None
        } else {
            Some(apn.to_string())
        }
    })
}

#[async_trait]
impl TransportDriver for RndisDriver {
    fn mode(&self) -> ConnectivityMode {
        ConnectivityMode::Rndis
    }

    async fn teardown(&self, plan: Teardown) -> Result<(), DriverError> {
        if plan.smart_refresh && !plan.deep_reset {
            self.smart_refresh().await;
        }

        let interface = self.interface().await;
        log_step(self.mode(), &format!("Link down on {}", interface));
        self.ctx
            .runner
            .run_checked("ip", &["link", "set", &interface, "down"], self.ctx.command_timeout)
            .await?;
        self.ctx.pause(plan.wait).await;
        Ok(())
    }

    async fn bring_up(&self, _apn: &str) -> Result<String, DriverError> {
        let detection = self.ctx.probe.detect(ConnectivityMode::Rndis).await;
        let interface = detection
            .interface
            .ok_or(DriverError::NoInterface("RNDIS"))?;

        log_step(self.mode(), &format!("Link up on {}", interface));
        self.ctx
            .runner
            .run_checked("ip", &["link", "set", &interface, "up"], self.ctx.command_timeout)
            .await?;
        self.ctx.run_dhcp(&interface).await?;
        Ok(interface)
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        self.ctx.wait_for_ip(self.mode(), timeout).await
    }
}
