//! Config source - re-read at the start of every rotation.
//!
//! A broken edit to the file must not take rotations down with it, so a
//! failed reload keeps serving the last config that parsed.

use rotor_common::{ConfigError, RotorConfig};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

pub trait ConfigSource: Send + Sync {
    /// Freshest usable config. May block on storage.
    fn current(&self) -> RotorConfig;

    /// Last config `current` produced, without touching storage
    fn cached(&self) -> RotorConfig;
}

/// [`ConfigSource::current`] on the blocking pool, for async callers
pub async fn reload(source: &Arc<dyn ConfigSource>) -> RotorConfig {
    let blocking = source.clone();
    match tokio::task::spawn_blocking(move || blocking.current()).await {
        Ok(config) => config,
        Err(e) => {
            warn!("  Config reload task failed ({}), using last good config", e);
            source.cached()
        }
    }
}

/// File-backed source with last-good fallback
pub struct FileConfigSource {
    path: PathBuf,
    last_good: RwLock<RotorConfig>,
}

impl FileConfigSource {
    /// Load once up front; startup fails on a bad file
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let config = RotorConfig::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            last_good: RwLock::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn current(&self) -> RotorConfig {
        match RotorConfig::load(&self.path) {
            Ok(config) => {
                debug!("  Config reloaded from {}", self.path.display());
                if let Ok(mut last) = self.last_good.write() {
                    *last = config.clone();
                }
                config
            }
            Err(e) => {
                warn!("  Config reload failed ({}), using last good config", e);
                self.cached()
            }
        }
    }

    fn cached(&self) -> RotorConfig {
        match self.last_good.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Fixed config, for tests and embedding
pub struct StaticConfigSource {
    config: RwLock<RotorConfig>,
}

impl StaticConfigSource {
    pub fn new(config: RotorConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Swap the config, as an operator edit would
    pub fn replace(&self, config: RotorConfig) {
        if let Ok(mut current) = self.config.write() {
            *current = config;
        }
    }
}

impl ConfigSource for StaticConfigSource {
    fn current(&self) -> RotorConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn cached(&self) -> RotorConfig {
        self.current()
    }
}
