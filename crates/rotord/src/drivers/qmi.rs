//! QMI transport (`wwan*` + `/dev/cdc-wdm*`).
//!
//! Teardown stops the WDS data session explicitly so the carrier releases
//! the session instead of waiting for an idle timeout, which is what makes
//! it hand back the same IP. The session is stopped by the packet data
//! handle and client ID that `--wds-start-network` printed; stopping it
//! with that CID also releases the client.

use super::carrier::CarrierProfile;
use super::{log_step, DriverContext, Teardown, TransportDriver};
use crate::error::DriverError;
use async_trait::async_trait;
use rotor_common::ConnectivityMode;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_INTERFACE: &str = "wwan0";

#[derive(Debug, Clone)]
pub struct QmiSettings {
    pub device: PathBuf,
    /// Root for `class/net/<iface>/qmi/raw_ip`
    pub sysfs_root: PathBuf,
}

impl QmiSettings {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

/// A data session started by `qmicli --wds-start-network`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WdsSession {
    pub handle: u32,
    pub cid: u8,
}

impl WdsSession {
    /// Parse the handle and CID out of qmicli's start output:
    ///
    /// ```text
    /// [/dev/cdc-wdm0] Network started
    ///     Packet data handle: '2264924160'
    /// [/dev/cdc-wdm0] Client ID not released:
    ///     Service: 'wds'
    ///         CID: '17'
    /// ```
    pub fn parse(output: &str) -> Option<Self> {
        let handle = quoted_value(output, "Packet data handle:")?.parse().ok()?;
        let cid = quoted_value(output, "CID:")?.parse().ok()?;
        Some(Self { handle, cid })
    }
}

fn quoted_value<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(key)?;
        Some(rest.trim().trim_matches('\''))
    })
}

pub struct QmiDriver {
    ctx: DriverContext,
    settings: QmiSettings,
    session: Mutex<Option<WdsSession>>,
}

impl QmiDriver {
    pub fn new(ctx: DriverContext, settings: QmiSettings) -> Self {
        Self {
            ctx,
            settings,
            session: Mutex::new(None),
        }
    }

    /// Session from the last bring-up, if any
    pub fn session(&self) -> Option<WdsSession> {
        self.session.lock().ok().and_then(|s| *s)
    }

    fn take_session(&self) -> Option<WdsSession> {
        self.session.lock().ok().and_then(|mut s| s.take())
    }

    fn store_session(&self, session: Option<WdsSession>) {
        if let Ok(mut s) = self.session.lock() {
            *s = session;
        }
    }

    /// Stop the data session. Without a known handle the modem's global
    /// autoconnect session is stopped instead, on a throwaway client. The
    /// session may already be gone, so failures are logged, not returned.
    async fn stop_session(&self, device: &str) -> Result<(), DriverError> {
        let mut owned = vec![
            "-p".to_string(),
            "-d".to_string(),
            device.to_string(),
            "--device-open-proxy".to_string(),
        ];
        match self.take_session() {
            Some(session) => {
                debug!("  Stopping WDS handle {} (CID {})", session.handle, session.cid);
                owned.push(format!("--wds-stop-network={}", session.handle));
                owned.push(format!("--client-cid={}", session.cid));
            }
            None => owned.push("--wds-stop-network=disable-autoconnect".to_string()),
        }
        let args: Vec<&str> = owned.iter().map(String::as_str).collect();

        let output = self
            .ctx
            .runner
            .run("qmicli", &args, self.ctx.command_timeout)
            .await?;
        if !output.success() {
            warn!("  WDS stop: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn interface(&self) -> String {
        self.ctx
            .probe
            .detect(ConnectivityMode::Qmi)
            .await
            .interface
            .unwrap_or_else(|| DEFAULT_INTERFACE.to_string())
    }

    fn device(&self) -> String {
        self.settings.device.display().to_string()
    }

    async fn link(&self, interface: &str, state: &str) -> Result<(), DriverError> {
        self.ctx
            .runner
            .run_checked("ip", &["link", "set", interface, state], self.ctx.command_timeout)
            .await?;
        Ok(())
    }

    /// Raw-IP framing is required by most QMI modems; best effort
    async fn enable_raw_ip(&self, interface: &str) {
        let path = self
            .settings
            .sysfs_root
            .join("class/net")
            .join(interface)
            .join("qmi/raw_ip");
        if !path.exists() {
            debug!("  {} not present, skipping raw_ip", path.display());
            return;
        }
        if let Err(e) = tokio::fs::write(&path, "Y").await {
            warn!("  Could not enable raw_ip on {}: {}", interface, e);
        }
    }
}

#[async_trait]
impl TransportDriver for QmiDriver {
    fn mode(&self) -> ConnectivityMode {
        ConnectivityMode::Qmi
    }

    async fn teardown(&self, plan: Teardown) -> Result<(), DriverError> {
        let interface = self.interface().await;
        let device = self.device();
        log_step(self.mode(), "Stopping data session");

        self.stop_session(&device).await?;
        self.link(&interface, "down").await?;
        self.ctx.pause(plan.wait).await;
        Ok(())
    }

    async fn bring_up(&self, apn: &str) -> Result<String, DriverError> {
        if !self.settings.device.exists() {
            return Err(DriverError::MissingDevice(self.device()));
        }

        let apn = CarrierProfile::default_for(apn).apn;
        let interface = self.interface().await;
        let device = self.device();
        log_step(self.mode(), &format!("Starting session on {} (APN {})", interface, apn));

        self.enable_raw_ip(&interface).await;
        self.link(&interface, "up").await?;

        let start = format!("--wds-start-network=apn='{}',ip-type=4", apn);
        let output = self
            .ctx
            .runner
            .run_checked(
                "qmicli",
                &[
                    "-p",
                    "-d",
                    &device,
                    "--device-open-proxy",
                    &start,
                    "--client-no-release-cid",
                ],
                self.ctx.command_timeout,
            )
            .await
            .map_err(|e| DriverError::BringUp(format!("WDS start failed: {}", e)))?;

        let session = WdsSession::parse(&output.stdout);
        match session {
            Some(s) => info!("  WDS session up (handle {}, CID {})", s.handle, s.cid),
            None => warn!("  WDS start printed no packet data handle"),
        }
        self.store_session(session);

        self.ctx.run_dhcp(&interface).await?;
        Ok(interface)
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        self.ctx.wait_for_ip(self.mode(), timeout).await
    }
}
