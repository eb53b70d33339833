//! Doctor - local diagnostics for a rotor install
//!
//! Checks the config file, the control API (with and without the token),
//! the history file, the cellular interfaces visible to the kernel and the
//! host's direct egress IP.
//!
//! Exit codes:
//! - 0: no failures (warnings allowed)
//! - 1: at least one check failed

use crate::client::{self, ApiClient};
use owo_colors::OwoColorize;
use rotor_common::{is_cellular_interface, ConfigError, IpHistory, RotorConfig};
use std::path::Path;
use std::time::Duration;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ISSUES: i32 = 1;

const SYS_CLASS_NET: &str = "/sys/class/net";
const DIRECT_IP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone)]
pub struct Check {
    pub name: &'static str,
    pub state: CheckState,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, state: CheckState, detail: impl Into<String>) -> Self {
        Self {
            name,
            state,
            detail: detail.into(),
        }
    }

    fn render(&self) -> String {
        let tag = match self.state {
            CheckState::Pass => "[OK]  ".bright_green().to_string(),
            CheckState::Warn => "[WARN]".yellow().to_string(),
            CheckState::Fail => "[FAIL]".bright_red().to_string(),
        };
        format!("{} {:<12} {}", tag, self.name, self.detail)
    }
}

/// Run every check, print the report and return the exit code
pub async fn run(config_path: &Path, url: Option<&str>, token: Option<String>) -> i32 {
    println!();
    println!("{}", format!("rotor doctor v{}", rotor_common::VERSION).bold());
    println!("{}", crate::output::SEPARATOR);

    let mut checks = Vec::new();

    // 1. Config
    let (check, config) = check_config(config_path);
    checks.push(check);
    let config = config.unwrap_or_default();

    // 2. Control API
    let base_url = url.map(str::to_string).unwrap_or_else(|| client::base_url(&config));
    let token = token.or_else(|| Some(config.api.token.clone()));
    match ApiClient::new(&base_url, token) {
        Ok(api) => checks.extend(check_api(&api).await),
        Err(e) => checks.push(Check::new("api", CheckState::Fail, e.to_string())),
    }

    // 3. History
    checks.push(check_history(&config.state_paths().history));

    // 4. Interfaces
    checks.push(check_interfaces(Path::new(SYS_CLASS_NET)));

    // 5. Direct egress
    checks.push(check_direct_ip(&config.verify.urls).await);

    for check in &checks {
        println!("{}", check.render());
    }
    println!("{}", crate::output::SEPARATOR);

    let failures = checks.iter().filter(|c| c.state == CheckState::Fail).count();
    if failures == 0 {
        println!("{}", "All checks passed".green());
        EXIT_OK
    } else {
        println!("{} {} check(s) failed", "x".red(), failures);
        EXIT_ISSUES
    }
}

pub fn check_config(path: &Path) -> (Check, Option<RotorConfig>) {
    match RotorConfig::load(path) {
        Ok(config) => (
            Check::new("config", CheckState::Pass, path.display().to_string()),
            Some(config),
        ),
        Err(ConfigError::NotFound(p)) => (
            Check::new("config", CheckState::Fail, format!("{} not found", p)),
            None,
        ),
        Err(e) => (
            Check::new("config", CheckState::Fail, format!("{}: {}", path.display(), e)),
            None,
        ),
    }
}

async fn check_api(api: &ApiClient) -> Vec<Check> {
    let status = match api.status().await {
        Ok(status) => status,
        Err(e) => {
            return vec![Check::new(
                "api",
                CheckState::Fail,
                format!("{} unreachable: {}", api.base_url(), e),
            )]
        }
    };

    let reachable = Check::new(
        "api",
        CheckState::Pass,
        format!(
            "{} (rotord v{}, mode {}, ip {})",
            api.base_url(),
            status.version,
            status.connection_mode,
            status.public_ip.as_deref().unwrap_or("unknown")
        ),
    );
    let auth = match api.auto_status().await {
        Ok(_) => Check::new("api token", CheckState::Pass, "accepted"),
        Err(e) => Check::new("api token", CheckState::Fail, e.to_string()),
    };
    vec![reachable, auth]
}

pub fn check_history(path: &Path) -> Check {
    if !path.exists() {
        return Check::new(
            "history",
            CheckState::Warn,
            format!("{} not created yet", path.display()),
        );
    }
    match IpHistory::load(path) {
        Ok(history) => Check::new(
            "history",
            CheckState::Pass,
            format!(
                "{} entries, {} rotations, last {}",
                history.ips.len(),
                history.rotations,
                history.last_ip().unwrap_or("-")
            ),
        ),
        Err(e) => Check::new("history", CheckState::Fail, format!("{}: {}", path.display(), e)),
    }
}

/// Cellular interface names under `net_dir` (normally `/sys/class/net`)
pub fn cellular_interfaces(net_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(net_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| is_cellular_interface(name))
        .collect();
    names.sort();
    names
}

pub fn check_interfaces(net_dir: &Path) -> Check {
    let names = cellular_interfaces(net_dir);
    if names.is_empty() {
        Check::new("interfaces", CheckState::Warn, "no cellular interface present")
    } else {
        Check::new("interfaces", CheckState::Pass, names.join(", "))
    }
}

/// The host's own egress, not through the proxy
async fn check_direct_ip(urls: &[String]) -> Check {
    let client = match reqwest::Client::builder().timeout(DIRECT_IP_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => return Check::new("direct ip", CheckState::Warn, e.to_string()),
    };

    for url in urls {
        let Ok(response) = client.get(url).send().await else {
            continue;
        };
        if !response.status().is_success() {
            continue;
        }
        if let Ok(body) = response.text().await {
            if let Ok(ip) = body.trim().parse::<std::net::Ipv4Addr>() {
                return Check::new("direct ip", CheckState::Pass, format!("{} via {}", ip, url));
            }
        }
    }
    Check::new("direct ip", CheckState::Warn, "no echo endpoint answered")
}
