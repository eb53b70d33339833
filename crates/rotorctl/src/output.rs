//! Output formatting - plain ASCII, colored status words

use owo_colors::OwoColorize;
use rotor_common::{
    AutoRotationStatus, ImeiStatus, IpHistory, RedactedConfig, RotateResponse, RotateStatus,
    StatusResponse,
};

pub const SEPARATOR: &str = "----------------------------------------";

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

pub fn format_status(status: &StatusResponse) -> String {
    let link = if status.connected {
        "[CONNECTED]".bright_green().to_string()
    } else {
        "[DISCONNECTED]".bright_red().to_string()
    };

    let mut lines = vec![
        format!("{}  rotord v{}", link, status.version),
        format!("  Public IP:   {}", or_dash(status.public_ip.as_deref())),
        format!("  Mode:        {}", status.connection_mode),
        format!("  Interface:   {}", or_dash(status.interface.as_deref())),
    ];
    if status.rotating {
        lines.push(format!(
            "  Rotation:    {} ({})",
            "in progress".yellow(),
            status.phase.as_str()
        ));
    }
    lines.join("\n")
}

pub fn format_rotate(result: &RotateResponse) -> String {
    let mut lines = Vec::new();
    match result.status {
        RotateStatus::Success => lines.push(format!(
            "{} {} -> {}",
            "[OK]".bright_green(),
            or_dash(result.previous_ip.as_deref()),
            or_dash(result.public_ip.as_deref()).bold()
        )),
        RotateStatus::Busy => lines.push(format!(
            "{} Rotation already in progress, retry shortly",
            "[BUSY]".yellow()
        )),
        RotateStatus::Failed => lines.push(format!(
            "{} {}",
            "[FAILED]".bright_red(),
            result.error.as_deref().unwrap_or("rotation failed")
        )),
    }

    if result.status != RotateStatus::Busy {
        let mode = result.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
        lines.push(format!("  Attempts: {}  Mode: {}", result.attempts, mode));
    }

    for attempt in &result.attempt_log {
        let mark = if attempt.succeeded { "ok" } else { "x" };
        let deep = if attempt.deep_reset { " deep-reset" } else { "" };
        lines.push(format!(
            "  #{} [{}]{} observed {}{}",
            attempt.attempt_number,
            mark,
            deep,
            or_dash(attempt.observed_ip.as_deref()),
            attempt
                .error
                .as_deref()
                .map(|e| format!(" - {}", e))
                .unwrap_or_default()
        ));
    }
    lines.join("\n")
}

/// Most recent `limit` entries, newest last
pub fn format_history(history: &IpHistory, limit: usize) -> String {
    let mut lines = vec![format!(
        "{} rotations, {} addresses recorded",
        history.rotations,
        history.ips.len()
    )];
    if let Some(first) = history.first_seen {
        lines.push(format!("First seen: {}", first.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    lines.push(SEPARATOR.to_string());

    if history.ips.is_empty() {
        lines.push("  (no history yet)".dimmed().to_string());
    }
    let skip = history.ips.len().saturating_sub(limit);
    for entry in history.ips.iter().skip(skip) {
        let ip = if entry.failed {
            format!("{} {}", entry.ip.bright_red(), "(failed)".dimmed())
        } else {
            entry.ip.clone()
        };
        let note = entry
            .note
            .as_deref()
            .map(|n| format!("  {}", n.dimmed()))
            .unwrap_or_default();
        lines.push(format!("  {} {}  {}{}", entry.date, entry.time, ip, note));
    }
    lines.join("\n")
}

pub fn format_auto(status: &AutoRotationStatus) -> String {
    let state = match (status.enabled, status.thread_alive) {
        (true, true) => "[ENABLED]".bright_green().to_string(),
        (true, false) => "[ENABLED, NOT RUNNING]".yellow().to_string(),
        (false, _) => "[DISABLED]".dimmed().to_string(),
    };

    let mut lines = vec![
        state,
        format!("  Interval:    {}s", status.interval_s),
    ];
    if let Some(next) = status.next_rotation_at {
        lines.push(format!("  Next:        {}", next.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    lines.push(format!("  Phase:       {}", status.phase.as_str()));
    lines.join("\n")
}

pub fn format_config(config: &RedactedConfig) -> String {
    let rotation = serde_json::to_string_pretty(&config.rotation).unwrap_or_default();
    [
        format!("  LAN IP:          {}", config.lan_ip),
        format!("  API port:        {}", config.api_port),
        format!(
            "  Proxy:           http {} / socks {} (auth {})",
            config.proxy_http_port,
            config.proxy_socks_port,
            if config.proxy_auth_enabled { "on" } else { "off" }
        ),
        format!(
            "  Modem mode:      {}",
            format!("{:?}", config.modem_mode).to_lowercase()
        ),
        format!("  APN:             {}", config.apn),
        format!(
            "  Auto-rotation:   {} every {}s",
            if config.pm2.enabled { "on" } else { "off" },
            config.pm2.ip_rotation_interval
        ),
        format!(
            "  Discord:         {}",
            if config.discord_configured { "configured" } else { "not configured" }
        ),
        format!("  Rotation:\n{}", indent(&rotation, 4)),
    ]
    .join("\n")
}

pub fn format_imei(status: &ImeiStatus) -> String {
    let changed = if status.changed {
        "yes".yellow().to_string()
    } else {
        "no".to_string()
    };
    [
        format!("  Original:  {}", or_dash(status.original.as_deref())),
        format!("  Current:   {}", or_dash(status.current.as_deref())),
        format!("  Changed:   {}", changed),
    ]
    .join("\n")
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines()
        .map(|l| format!("{}{}", pad, l))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Display an error
pub fn display_error(message: &str) {
    eprintln!("[ERROR] {}", message.red());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rotor_common::{ConnectivityMode, RotationAttemptResult, RotationPhase};

    fn status(connected: bool) -> StatusResponse {
        StatusResponse {
            public_ip: connected.then(|| "5.6.7.8".to_string()),
            connection_mode: ConnectivityMode::Qmi,
            interface: Some("wwan0".to_string()),
            connected,
            rotating: false,
            phase: RotationPhase::Idle,
            version: "0.4.2".to_string(),
        }
    }

    #[test]
    fn test_status_lines() {
        let text = format_status(&status(true));
        assert!(text.contains("CONNECTED"));
        assert!(text.contains("5.6.7.8"));
        assert!(text.contains("qmi"));
        assert!(!text.contains("Rotation:"));

        let mut rotating = status(false);
        rotating.rotating = true;
        rotating.phase = RotationPhase::BringingUp;
        let text = format_status(&rotating);
        assert!(text.contains("DISCONNECTED"));
        assert!(text.contains("bringing_up"));
    }

    #[test]
    fn test_rotate_failure_shows_attempts() {
        let result = RotateResponse {
            status: RotateStatus::Failed,
            public_ip: None,
            previous_ip: Some("1.2.3.4".to_string()),
            attempts: 2,
            error: Some("IP unchanged (1.2.3.4)".to_string()),
            mode: Some(ConnectivityMode::Rndis),
            attempt_log: vec![
                RotationAttemptResult {
                    attempt_number: 1,
                    previous_ip: Some("1.2.3.4".to_string()),
                    observed_ip: Some("1.2.3.4".to_string()),
                    succeeded: false,
                    deep_reset: false,
                    error: Some("IP unchanged (1.2.3.4)".to_string()),
                },
                RotationAttemptResult {
                    attempt_number: 2,
                    previous_ip: Some("1.2.3.4".to_string()),
                    observed_ip: Some("1.2.3.4".to_string()),
                    succeeded: false,
                    deep_reset: true,
                    error: Some("IP unchanged (1.2.3.4)".to_string()),
                },
            ],
        };
        let text = format_rotate(&result);
        assert!(text.contains("FAILED"));
        assert!(text.contains("Attempts: 2  Mode: rndis"));
        assert!(text.contains("#2 [x] deep-reset"));
    }

    #[test]
    fn test_rotate_busy_is_short() {
        let text = format_rotate(&RotateResponse::busy());
        assert!(text.contains("BUSY"));
        assert!(!text.contains("Attempts"));
    }

    #[test]
    fn test_history_limit_keeps_newest() {
        let mut history = IpHistory::default();
        for i in 1..=5u8 {
            let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, i as u32, 0).unwrap();
            history.record_observed(&format!("10.0.0.{}", i), now);
        }
        let text = format_history(&history, 2);
        assert!(!text.contains("10.0.0.3"));
        assert!(text.contains("10.0.0.4"));
        assert!(text.contains("10.0.0.5"));
        assert!(text.contains("First seen: 2026-03-01 12:01:00 UTC"));
    }

    #[test]
    fn test_history_empty() {
        let text = format_history(&IpHistory::default(), 20);
        assert!(text.contains("0 rotations"));
        assert!(text.contains("no history yet"));
    }

    #[test]
    fn test_auto_states() {
        let mut status = AutoRotationStatus {
            enabled: true,
            interval_s: 3600,
            thread_alive: false,
            next_rotation_at: None,
            phase: RotationPhase::Idle,
        };
        assert!(format_auto(&status).contains("NOT RUNNING"));
        status.enabled = false;
        assert!(format_auto(&status).contains("DISABLED"));
        assert!(format_auto(&status).contains("3600s"));
    }

    #[test]
    fn test_config_lines() {
        let config = RedactedConfig::from(&rotor_common::RotorConfig::default());
        let text = format_config(&config);
        assert!(text.contains("Modem mode:      auto"));
        assert!(text.contains("not configured"));
        assert!(text.contains("max_attempts"));
    }
}
