//! AT command port.
//!
//! The SIM7600-class modems expose several `ttyUSB*` nodes; the AT port is
//! usually `ttyUSB2`. The port runs raw at 115200 baud and every exchange
//! reads until a final `OK` / `ERROR` line or the timeout.

use crate::error::ModemError;
use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Fallback AT port when nothing else is found
pub const DEFAULT_AT_PORT: &str = "/dev/ttyUSB2";

#[async_trait]
pub trait AtPort: Send + Sync {
    /// Send one command and return the full response on `OK`.
    /// An `ERROR` reply becomes [`ModemError::Rejected`].
    async fn send(&self, command: &str, timeout: Duration) -> Result<String, ModemError>;
}

/// Final result code of a response buffer, if one has arrived
pub(crate) fn final_result(buffer: &str) -> Option<bool> {
    for line in buffer.lines().map(str::trim) {
        if line == "OK" {
            return Some(true);
        }
        if line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR") {
            return Some(false);
        }
    }
    None
}

/// Resolve the AT port: configured path, then `ttyUSB2`, then the first `ttyUSB*`
pub fn detect_port(configured: Option<&str>, dev_dir: &Path) -> Option<PathBuf> {
    if let Some(port) = configured {
        let path = PathBuf::from(port);
        if path.exists() {
            return Some(path);
        }
        debug!("  Configured AT port {} is missing", port);
    }

    let preferred = dev_dir.join("ttyUSB2");
    if preferred.exists() {
        return Some(preferred);
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dev_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("ttyUSB"))
        .map(|entry| entry.path())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Serial AT port backed by a tty device
pub struct SerialAtPort {
    configured: Option<String>,
    dev_dir: PathBuf,
    // one exchange at a time on the tty
    lock: tokio::sync::Mutex<()>,
}

impl SerialAtPort {
    pub fn new(configured: Option<String>) -> Self {
        Self {
            configured,
            dev_dir: PathBuf::from("/dev"),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Port that would be used right now
    pub fn resolve(&self) -> Option<PathBuf> {
        detect_port(self.configured.as_deref(), &self.dev_dir)
    }
}

#[async_trait]
impl AtPort for SerialAtPort {
    async fn send(&self, command: &str, timeout: Duration) -> Result<String, ModemError> {
        let _guard = self.lock.lock().await;
        let path = self.resolve().ok_or(ModemError::PortNotFound)?;
        let command_owned = command.to_string();

        debug!("  AT {} -> {}", path.display(), command);
        let response = tokio::task::spawn_blocking(move || {
            exchange(&path, &command_owned, timeout)
        })
        .await
        .map_err(|e| ModemError::NotReady(format!("AT worker failed: {}", e)))??;

        match final_result(&response) {
            Some(true) => Ok(response),
            Some(false) => Err(ModemError::Rejected {
                command: command.to_string(),
                response: response.trim().to_string(),
            }),
            None => Err(ModemError::Timeout {
                command: command.to_string(),
                timeout,
            }),
        }
    }
}

fn open_raw(path: &Path) -> Result<File, ModemError> {
    let port = path.display().to_string();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)
        .map_err(|source| ModemError::Io {
            port: port.clone(),
            source,
        })?;

    let termios_err = |e: nix::Error| ModemError::Termios {
        port: port.clone(),
        message: e.to_string(),
    };

    let mut settings = termios::tcgetattr(&file).map_err(termios_err)?;
    termios::cfmakeraw(&mut settings);
    termios::cfsetspeed(&mut settings, BaudRate::B115200).map_err(termios_err)?;
    // non-blocking-ish reads: return after 100ms of silence
    settings.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    settings.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
    termios::tcsetattr(&file, SetArg::TCSANOW, &settings).map_err(termios_err)?;

    Ok(file)
}

fn exchange(path: &Path, command: &str, timeout: Duration) -> Result<String, ModemError> {
    let port = path.display().to_string();
    let io_err = |source| ModemError::Io {
        port: port.clone(),
        source,
    };

    let mut file = open_raw(path)?;
    file.write_all(format!("{}\r", command).as_bytes())
        .map_err(io_err)?;
    file.flush().map_err(io_err)?;

    let deadline = Instant::now() + timeout;
    let mut response = String::new();
    let mut chunk = [0u8; 256];
    while Instant::now() < deadline {
        let n = file.read(&mut chunk).map_err(io_err)?;
        if n > 0 {
            response.push_str(&String::from_utf8_lossy(&chunk[..n]));
            if final_result(&response).is_some() {
                break;
            }
        }
    }
    Ok(response)
}

// ============================================================================
// Fake AT port (testing)
// ============================================================================

#[derive(Debug, Clone)]
enum AtReply {
    Ok(String),
    Reject(String),
    Timeout,
}

/// Scripted AT port. Replies match by command prefix; queued replies for the
/// same prefix are consumed in order and the last one sticks. Unmatched
/// commands answer `OK`.
#[derive(Clone, Default)]
pub struct FakeAtPort {
    replies: Arc<Mutex<Vec<(String, VecDeque<AtReply>)>>>,
    sent: Arc<Mutex<Vec<String>>>,
    gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl FakeAtPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, body: &str) -> &Self {
        self.push(prefix, AtReply::Ok(format!("{}\r\nOK\r\n", body)))
    }

    pub fn reject(&self, prefix: &str) -> &Self {
        self.push(prefix, AtReply::Reject("ERROR".to_string()))
    }

    pub fn time_out(&self, prefix: &str) -> &Self {
        self.push(prefix, AtReply::Timeout)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Make every command wait for a notification on the returned handle
    pub fn hold(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        if let Ok(mut gate) = self.gate.lock() {
            *gate = Some(notify.clone());
        }
        notify
    }

    fn push(&self, prefix: &str, reply: AtReply) -> &Self {
        if let Ok(mut replies) = self.replies.lock() {
            match replies.iter_mut().find(|(p, _)| p == prefix) {
                Some((_, queue)) => queue.push_back(reply),
                None => replies.push((prefix.to_string(), VecDeque::from([reply]))),
            }
        }
        self
    }
}

#[async_trait]
impl AtPort for FakeAtPort {
    async fn send(&self, command: &str, timeout: Duration) -> Result<String, ModemError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.to_string());
        }

        let gate = self.gate.lock().ok().and_then(|g| g.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let reply = self.replies.lock().ok().and_then(|mut replies| {
            let (_, queue) = replies
                .iter_mut()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });

        match reply {
            None => Ok("OK\r\n".to_string()),
            Some(AtReply::Ok(body)) => Ok(body),
            Some(AtReply::Reject(response)) => Err(ModemError::Rejected {
                command: command.to_string(),
                response,
            }),
            Some(AtReply::Timeout) => Err(ModemError::Timeout {
                command: command.to_string(),
                timeout,
            }),
        }
    }
}
