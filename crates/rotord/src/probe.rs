//! Interface probe - which cellular transport is present and does it have an IP.
//!
//! QMI shows up as `wwan*`, RNDIS/ECM as `enx*`, `eth1` or `usb0`, PPP as
//! `ppp0`. `(None, false)` means no interface, `(Some, false)` means the
//! interface exists but is still negotiating. Shell failures and timeouts
//! count as "not detected" and never reach the caller.

use crate::shell::CommandRunner;
use async_trait::async_trait;
use rotor_common::ConnectivityMode;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub use rotor_common::{is_cellular_interface, matches_mode, PPP_INTERFACE};

/// Result of probing one transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub interface: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
}

impl Detection {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn present(interface: &str, ipv4: Option<Ipv4Addr>) -> Self {
        Self {
            interface: Some(interface.to_string()),
            ipv4,
        }
    }

    pub fn has_ip(&self) -> bool {
        self.ipv4.is_some()
    }

    pub fn exists(&self) -> bool {
        self.interface.is_some()
    }
}

#[async_trait]
pub trait InterfaceProbe: Send + Sync {
    async fn detect(&self, mode: ConnectivityMode) -> Detection;

    /// Highest-priority transport with an IP, else the first whose
    /// interface exists, else `None`.
    async fn detect_active(&self) -> (ConnectivityMode, Detection) {
        let mut first_present = None;
        for mode in ConnectivityMode::PRIORITY {
            let detection = self.detect(mode).await;
            if detection.has_ip() {
                return (mode, detection);
            }
            if detection.exists() && first_present.is_none() {
                first_present = Some((mode, detection));
            }
        }
        first_present.unwrap_or((ConnectivityMode::None, Detection::absent()))
    }
}

/// Probe backed by `ip -o link` / `ip -4 -o addr`
pub struct IpProbe {
    runner: Arc<dyn CommandRunner>,
}

impl IpProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn list_interfaces(&self) -> Vec<String> {
        match self
            .runner
            .run("ip", &["-o", "link", "show"], PROBE_TIMEOUT)
            .await
        {
            Ok(output) if output.success() => parse_link_names(&output.stdout),
            Ok(output) => {
                debug!("  ip link failed: {}", output.stderr.trim());
                Vec::new()
            }
            Err(e) => {
                debug!("  ip link unavailable: {}", e);
                Vec::new()
            }
        }
    }

    async fn ipv4_of(&self, interface: &str) -> Option<Ipv4Addr> {
        match self
            .runner
            .run("ip", &["-4", "-o", "addr", "show", "dev", interface], PROBE_TIMEOUT)
            .await
        {
            Ok(output) if output.success() => parse_inet(&output.stdout),
            Ok(_) => None,
            Err(e) => {
                debug!("  ip addr for {} unavailable: {}", interface, e);
                None
            }
        }
    }

    async fn interface_exists(&self, interface: &str) -> bool {
        match self
            .runner
            .run("ip", &["-o", "link", "show", "dev", interface], PROBE_TIMEOUT)
            .await
        {
            Ok(output) => output.success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl InterfaceProbe for IpProbe {
    async fn detect(&self, mode: ConnectivityMode) -> Detection {
        match mode {
            ConnectivityMode::None => Detection::absent(),
            ConnectivityMode::Ppp => {
                if !self.interface_exists(PPP_INTERFACE).await {
                    return Detection::absent();
                }
                Detection::present(PPP_INTERFACE, self.ipv4_of(PPP_INTERFACE).await)
            }
            ConnectivityMode::Qmi | ConnectivityMode::Rndis => {
                let candidates: Vec<String> = self
                    .list_interfaces()
                    .await
                    .into_iter()
                    .filter(|name| matches_mode(name, mode))
                    .collect();

                let mut first = None;
                for name in candidates {
                    let ip = self.ipv4_of(&name).await;
                    if ip.is_some() {
                        return Detection::present(&name, ip);
                    }
                    if first.is_none() {
                        first = Some(name);
                    }
                }
                match first {
                    Some(name) => Detection::present(&name, None),
                    None => Detection::absent(),
                }
            }
        }
    }
}

/// Interface names from `ip -o link show`, e.g. `3: wwan0: <POINTOPOINT,...>`
pub(crate) fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let _index = parts.next()?;
            let name = parts.next()?.trim();
            let name = name.split('@').next()?.trim();
            if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}

/// First IPv4 from `ip -4 -o addr show`, e.g. `5: wwan0    inet 10.1.2.3/30 ...`
pub(crate) fn parse_inet(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "inet")?;
        let cidr = tokens.next()?;
        cidr.split('/').next()?.parse().ok()
    })
}

// ============================================================================
// Fake probe (testing)
// ============================================================================

/// Probe whose answers are set by the test (or by a fake driver)
#[derive(Clone, Default)]
pub struct FakeProbe {
    state: Arc<Mutex<HashMap<ConnectivityMode, Detection>>>,
    calls: Arc<Mutex<u32>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, mode: ConnectivityMode, detection: Detection) {
        if let Ok(mut state) = self.state.lock() {
            state.insert(mode, detection);
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl InterfaceProbe for FakeProbe {
    async fn detect(&self, mode: ConnectivityMode) -> Detection {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        self.state
            .lock()
            .ok()
            .and_then(|s| s.get(&mode).cloned())
            .unwrap_or_default()
    }
}
