//! Public IP history - a bounded, append-only diary of observed IPs.
//!
//! Persisted as `ip_history.json` in the state directory. The layout
//! (`ips` / `rotations` / `first_seen`, entries carrying `date` and `time`
//! strings) is what the dashboard reads.

use crate::error::HistoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Number of entries kept; oldest are evicted first
pub const HISTORY_CAP: usize = 10;

/// One observed public IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpHistoryEntry {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    /// `YYYY-MM-DD`, for display
    pub date: String,
    /// `HH:MM:SS`, for display
    pub time: String,
    /// Forced record of an exhausted rotation
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl IpHistoryEntry {
    fn new(ip: &str, now: DateTime<Utc>, failed: bool, note: Option<String>) -> Self {
        Self {
            ip: ip.to_string(),
            timestamp: now,
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            failed,
            note,
        }
    }
}

/// The persisted history document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpHistory {
    #[serde(default)]
    pub ips: Vec<IpHistoryEntry>,
    /// Observed transitions plus forced failure records
    #[serde(default)]
    pub rotations: u64,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
}

impl IpHistory {
    /// Most recent successfully observed IP
    pub fn last_ip(&self) -> Option<&str> {
        self.ips
            .iter()
            .rev()
            .find(|e| !e.failed)
            .map(|e| e.ip.as_str())
    }

    pub fn last_entry(&self) -> Option<&IpHistoryEntry> {
        self.ips.last()
    }

    /// Record an observed public IP.
    ///
    /// Identical consecutive observations are skipped. The very first
    /// observation sets `first_seen` without counting as a rotation.
    /// Returns true when an entry was appended.
    pub fn record_observed(&mut self, ip: &str, now: DateTime<Utc>) -> bool {
        let previous = self.last_ip().map(str::to_string);
        if previous.as_deref() == Some(ip) {
            return false;
        }

        if self.first_seen.is_none() {
            self.first_seen = Some(now);
        }
        if previous.is_some() {
            self.rotations += 1;
        }

        self.ips.push(IpHistoryEntry::new(ip, now, false, None));
        self.evict();
        true
    }

    /// Force a failure record so exhausted rotations stay visible
    pub fn record_failure(&mut self, ip: &str, note: &str, now: DateTime<Utc>) {
        if self.first_seen.is_none() {
            self.first_seen = Some(now);
        }
        self.rotations += 1;
        self.ips
            .push(IpHistoryEntry::new(ip, now, true, Some(note.to_string())));
        self.evict();
    }

    fn evict(&mut self) {
        if self.ips.len() > HISTORY_CAP {
            let excess = self.ips.len() - HISTORY_CAP;
            self.ips.drain(..excess);
        }
    }

    /// Load from disk; a missing file is an empty history
    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Write atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_observation_is_not_a_rotation() {
        let mut history = IpHistory::default();
        assert!(history.record_observed("1.2.3.4", at(0)));
        assert_eq!(history.rotations, 0);
        assert_eq!(history.first_seen, Some(at(0)));
        assert_eq!(history.ips[0].date, "2023-11-14");
    }

    #[test]
    fn test_consecutive_duplicates_skipped() {
        let mut history = IpHistory::default();
        history.record_observed("1.2.3.4", at(0));
        assert!(!history.record_observed("1.2.3.4", at(10)));
        assert!(history.record_observed("5.6.7.8", at(20)));
        assert_eq!(history.ips.len(), 2);
        assert_eq!(history.rotations, 1);
        assert_eq!(history.first_seen, Some(at(0)));
    }

    #[test]
    fn test_failure_records_always_append() {
        let mut history = IpHistory::default();
        history.record_observed("1.2.3.4", at(0));
        history.record_failure("1.2.3.4", "IP unchanged", at(5));
        history.record_failure("1.2.3.4", "IP unchanged", at(6));

        assert_eq!(history.ips.len(), 3);
        assert_eq!(history.rotations, 2);
        assert!(history.ips[2].failed);
        assert_eq!(history.last_ip(), Some("1.2.3.4"));
        // a failure entry does not break duplicate detection
        assert!(!history.record_observed("1.2.3.4", at(7)));
    }

    #[test]
    fn test_fifo_eviction_at_cap() {
        let mut history = IpHistory::default();
        for i in 0..(HISTORY_CAP + 5) {
            history.record_observed(&format!("10.0.0.{}", i), at(i as i64));
        }
        assert_eq!(history.ips.len(), HISTORY_CAP);
        assert_eq!(history.ips[0].ip, "10.0.0.5");
        assert_eq!(history.rotations, (HISTORY_CAP + 4) as u64);
        assert_eq!(history.first_seen, Some(at(0)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ip_history.json");

        let mut history = IpHistory::default();
        history.record_observed("1.2.3.4", at(0));
        history.record_failure("1.2.3.4", "same IP", at(1));
        history.save(&path).unwrap();

        let loaded = IpHistory::load(&path).unwrap();
        assert_eq!(loaded, history);
    }

    #[test]
    fn test_load_legacy_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip_history.json");
        fs::write(
            &path,
            r#"{"ips":[{"ip":"1.2.3.4","timestamp":"2024-01-01T10:00:00Z","date":"2024-01-01","time":"10:00:00"}],"rotations":4,"first_seen":"2024-01-01T09:00:00Z"}"#,
        )
        .unwrap();

        let loaded = IpHistory::load(&path).unwrap();
        assert_eq!(loaded.rotations, 4);
        assert!(!loaded.ips[0].failed);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = IpHistory::load(&dir.path().join("none.json")).unwrap();
        assert!(loaded.ips.is_empty());
    }
}
