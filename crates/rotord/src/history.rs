//! History store - serialized access to `ip_history.json`.

use chrono::Utc;
use rotor_common::{HistoryError, IpHistory};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

pub struct HistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document. A corrupt file is moved aside to
    /// `ip_history.json.corrupt` and reads as empty.
    pub async fn snapshot(&self) -> IpHistory {
        let _guard = self.lock.lock().await;
        self.load_or_default()
    }

    /// Record an observed public IP, returns true if an entry was appended
    pub async fn record_observed(&self, ip: &str) -> Result<bool, HistoryError> {
        let _guard = self.lock.lock().await;
        let mut history = self.load_or_default();
        let appended = history.record_observed(ip, Utc::now());
        if appended {
            history.save(&self.path)?;
        }
        Ok(appended)
    }

    /// Force a failure record for an exhausted rotation
    pub async fn record_failure(&self, ip: &str, note: &str) -> Result<(), HistoryError> {
        let _guard = self.lock.lock().await;
        let mut history = self.load_or_default();
        history.record_failure(ip, note, Utc::now());
        history.save(&self.path)
    }

    fn load_or_default(&self) -> IpHistory {
        match IpHistory::load(&self.path) {
            Ok(history) => history,
            Err(HistoryError::Json(e)) => {
                let aside = self.corrupt_path();
                match std::fs::rename(&self.path, &aside) {
                    Ok(()) => warn!(
                        "  History at {} is corrupt ({}), moved to {}",
                        self.path.display(),
                        e,
                        aside.display()
                    ),
                    Err(re) => warn!(
                        "  History at {} is corrupt ({}) and could not be moved aside: {}",
                        self.path.display(),
                        e,
                        re
                    ),
                }
                IpHistory::default()
            }
            Err(e) => {
                warn!("  History at {} unreadable ({}), starting fresh", self.path.display(), e);
                IpHistory::default()
            }
        }
    }

    pub fn corrupt_path(&self) -> PathBuf {
        self.path.with_extension("json.corrupt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("ip_history.json"));

        assert!(store.record_observed("1.2.3.4").await.unwrap());
        assert!(!store.record_observed("1.2.3.4").await.unwrap());
        store.record_failure("1.2.3.4", "IP unchanged").await.unwrap();

        let history = store.snapshot().await;
        assert_eq!(history.ips.len(), 2);
        assert!(history.ips[1].failed);
        assert_eq!(history.rotations, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::new(dir.path().join("ip_history.json")));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.record_failure(&format!("10.0.0.{}", i), "x").await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.snapshot().await.rotations, 8);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip_history.json");
        std::fs::write(&path, "{\"rotations\": 41, not json").unwrap();
        let store = HistoryStore::new(&path);

        assert!(store.record_observed("1.2.3.4").await.unwrap());

        let aside = dir.path().join("ip_history.json.corrupt");
        assert_eq!(store.corrupt_path(), aside);
        assert_eq!(
            std::fs::read_to_string(&aside).unwrap(),
            "{\"rotations\": 41, not json"
        );
        let history = store.snapshot().await;
        assert_eq!(history.last_ip(), Some("1.2.3.4"));
        assert_eq!(history.rotations, 0);
    }
}
