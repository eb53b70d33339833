//! Connectivity modes and rotation method enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cellular transport currently carrying (or expected to carry) egress traffic.
///
/// Never persisted; recomputed by probing at every decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityMode {
    Qmi,
    Rndis,
    Ppp,
    None,
}

impl ConnectivityMode {
    /// Auto-detection priority order.
    pub const PRIORITY: [ConnectivityMode; 3] = [
        ConnectivityMode::Qmi,
        ConnectivityMode::Rndis,
        ConnectivityMode::Ppp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityMode::Qmi => "qmi",
            ConnectivityMode::Rndis => "rndis",
            ConnectivityMode::Ppp => "ppp",
            ConnectivityMode::None => "none",
        }
    }
}

impl fmt::Display for ConnectivityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed PPP interface name
pub const PPP_INTERFACE: &str = "ppp0";

/// Whether an interface name belongs to a transport
pub fn matches_mode(name: &str, mode: ConnectivityMode) -> bool {
    match mode {
        ConnectivityMode::Qmi => name.starts_with("wwan"),
        ConnectivityMode::Rndis => name.starts_with("enx") || name == "eth1" || name == "usb0",
        ConnectivityMode::Ppp => name == PPP_INTERFACE,
        ConnectivityMode::None => false,
    }
}

/// Any interface name a cellular transport could use
pub fn is_cellular_interface(name: &str) -> bool {
    ConnectivityMode::PRIORITY
        .iter()
        .any(|mode| matches_mode(name, *mode))
        || name.starts_with("ppp")
}

/// Operator preference for which transport to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModePreference {
    #[default]
    Auto,
    Qmi,
    Rndis,
    Ppp,
}

impl ModePreference {
    /// The forced mode, or `None` for auto-detection.
    pub fn forced(&self) -> Option<ConnectivityMode> {
        match self {
            ModePreference::Auto => None,
            ModePreference::Qmi => Some(ConnectivityMode::Qmi),
            ModePreference::Rndis => Some(ConnectivityMode::Rndis),
            ModePreference::Ppp => Some(ConnectivityMode::Ppp),
        }
    }
}

/// Modem-level reset applied when a plain transport bounce is not enough.
///
/// Ordered by disruptiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeepResetMethod {
    None,
    /// AT detach, CFUN off/on, reattach, reactivate PDP context
    #[default]
    #[serde(alias = "at")]
    RadioCycle,
    /// Identity change + module reboot, falls through to radio-cycle
    #[serde(alias = "imei")]
    ImeiRandomize,
    /// ModemManager disable/enable lifecycle instead of raw AT commands
    #[serde(alias = "modem-manager", alias = "mmcli")]
    ServiceReset,
}

impl DeepResetMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeepResetMethod::None => "none",
            DeepResetMethod::RadioCycle => "radio-cycle",
            DeepResetMethod::ImeiRandomize => "imei-randomize",
            DeepResetMethod::ServiceReset => "service-reset",
        }
    }
}

impl fmt::Display for DeepResetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_at_alias_maps_to_radio_cycle() {
        let method: DeepResetMethod = serde_yaml::from_str("at").unwrap();
        assert_eq!(method, DeepResetMethod::RadioCycle);
    }

    #[test]
    fn test_forced_mode() {
        assert_eq!(ModePreference::Auto.forced(), None);
        assert_eq!(ModePreference::Ppp.forced(), Some(ConnectivityMode::Ppp));
    }
}
