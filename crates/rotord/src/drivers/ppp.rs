//! PPP transport (`ppp0` over a serial modem port).
//!
//! Bring-up resolves the carrier profile, writes the pppd peer file and
//! chat script for it, and dials with `pppd call <peer>`.

use super::carrier::{self, CarrierProfile, PppAuth};
use super::{log_step, DriverContext, Teardown, TransportDriver};
use crate::error::DriverError;
use crate::modem::at::{detect_port, DEFAULT_AT_PORT};
use crate::probe::PPP_INTERFACE;
use crate::wait::poll_until;
use async_trait::async_trait;
use rotor_common::ConnectivityMode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const PPPD_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PppSettings {
    pub peer: String,
    pub peers_dir: PathBuf,
    pub chat_dir: PathBuf,
    /// Serial port pppd dials on; auto-detected when unset
    pub tty: Option<String>,
}

pub struct PppDriver {
    ctx: DriverContext,
    settings: PppSettings,
}

impl PppDriver {
    pub fn new(ctx: DriverContext, settings: PppSettings) -> Self {
        Self { ctx, settings }
    }

    fn tty(&self) -> String {
        detect_port(self.settings.tty.as_deref(), Path::new("/dev"))
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| DEFAULT_AT_PORT.to_string())
    }

    async fn read_imsi(&self) -> Option<String> {
        match self.ctx.at.send("AT+CIMI", self.ctx.at_timeout).await {
            Ok(response) => carrier::parse_imsi(&response),
            Err(e) => {
                debug!("  IMSI unavailable: {}", e);
                None
            }
        }
    }

    pub fn peer_path(&self) -> PathBuf {
        self.settings.peers_dir.join(&self.settings.peer)
    }

    pub fn chat_path(&self) -> PathBuf {
        self.settings.chat_dir.join(&self.settings.peer)
    }

    async fn write_profile(&self, profile: &CarrierProfile) -> Result<(), DriverError> {
        let chat_path = self.chat_path();
        let peer = render_peer(profile, &self.tty(), &chat_path);
        let chat = render_chat(profile);

        tokio::fs::create_dir_all(&self.settings.peers_dir).await?;
        tokio::fs::create_dir_all(&self.settings.chat_dir).await?;
        tokio::fs::write(self.peer_path(), peer).await?;
        tokio::fs::write(&chat_path, chat).await?;
        debug!("  Wrote PPP peer {}", self.peer_path().display());
        Ok(())
    }
}

/// pppd peer options for a profile
pub fn render_peer(profile: &CarrierProfile, tty: &str, chat_path: &Path) -> String {
    let mut out = format!(
        "# {} ({})\n{}\n115200\nconnect \"/usr/sbin/chat -v -f {}\"\n",
        profile.name,
        profile.apn,
        tty,
        chat_path.display()
    );
    // the routing guard owns default routes
    out.push_str("nodefaultroute\nnoipdefault\nusepeerdns\nnoauth\nnovj\nhide-password\n");
    out.push_str("lcp-echo-interval 30\nlcp-echo-failure 4\n");

    if profile.needs_auth() {
        out.push_str(&format!("user \"{}\"\npassword \"{}\"\n", profile.user, profile.password));
        match profile.auth {
            PppAuth::Chap => out.push_str("refuse-pap\n"),
            PppAuth::Pap => out.push_str("refuse-chap\n"),
            PppAuth::None => {}
        }
    }
    out
}

/// chat script dialing the profile's APN
pub fn render_chat(profile: &CarrierProfile) -> String {
    format!(
        "ABORT \"BUSY\"\nABORT \"NO CARRIER\"\nABORT \"ERROR\"\nTIMEOUT 30\n\"\" AT\nOK AT+CGDCONT=1,\"IP\",\"{}\"\nOK ATD*99#\nCONNECT \"\"\n",
        profile.apn
    )
}

#[async_trait]
impl TransportDriver for PppDriver {
    fn mode(&self) -> ConnectivityMode {
        ConnectivityMode::Ppp
    }

    async fn teardown(&self, plan: Teardown) -> Result<(), DriverError> {
        log_step(self.mode(), "Stopping pppd");
        // exit 1 just means no pppd was running
        let kill = self
            .ctx
            .runner
            .run("pkill", &["pppd"], self.ctx.command_timeout)
            .await?;
        if kill.code > 1 {
            warn!("  pkill pppd exited {}: {}", kill.code, kill.stderr.trim());
        }

        let probe = self.ctx.probe.clone();
        let gone = poll_until(PPPD_EXIT_TIMEOUT, Duration::from_secs(1), &self.ctx.cancel, || {
            let probe = probe.clone();
            async move { !probe.detect(ConnectivityMode::Ppp).await.exists() }
        })
        .await;
        if !gone.is_ready() {
            warn!("  {} still present after pkill", PPP_INTERFACE);
        }

        self.ctx.pause(plan.wait).await;
        Ok(())
    }

    async fn bring_up(&self, apn: &str) -> Result<String, DriverError> {
        let imsi = self.read_imsi().await;
        let profile = carrier::resolve(apn, imsi.as_deref());
        log_step(
            self.mode(),
            &format!("Dialing {} via {} (APN {})", self.settings.peer, profile.name, profile.apn),
        );

        self.write_profile(&profile).await?;
        self.ctx
            .runner
            .run_checked("pppd", &["call", &self.settings.peer], self.ctx.command_timeout)
            .await
            .map_err(|e| DriverError::BringUp(format!("pppd failed: {}", e)))?;
        Ok(PPP_INTERFACE.to_string())
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        self.ctx.wait_for_ip(self.mode(), timeout).await
    }
}
