//! IMEI handling: read, randomize, and keep the original on disk.

use super::at::AtPort;
use crate::error::ModemError;
use rand::Rng;
use rotor_common::ImeiStatus;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Type allocation codes used when the original IMEI is unknown (SIM7600 family)
const FALLBACK_TACS: [&str; 3] = ["86147504", "86278103", "35730708"];

/// Pull the 15-digit IMEI out of an `AT+CGSN` response
pub fn parse_imei(response: &str) -> Option<String> {
    response
        .lines()
        .map(|line| line.trim().trim_start_matches("+CGSN:").trim())
        .find(|line| line.len() == 15 && line.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Luhn check digit for the first 14 digits
pub fn luhn_check_digit(body: &str) -> u32 {
    let sum: u32 = body
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| {
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    (10 - sum % 10) % 10
}

/// Plausible IMEI: 8-digit TAC, 6 random serial digits, Luhn digit.
/// Reuses the TAC of `original` so the device model stays the same.
pub fn generate_imei<R: Rng>(original: Option<&str>, rng: &mut R) -> String {
    let tac = original
        .filter(|imei| imei.len() >= 8 && imei.chars().all(|c| c.is_ascii_digit()))
        .map(|imei| imei[..8].to_string())
        .unwrap_or_else(|| FALLBACK_TACS[rng.gen_range(0..FALLBACK_TACS.len())].to_string());

    let serial: String = (0..6)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
    let body = format!("{}{}", tac, serial);
    let check = luhn_check_digit(&body);
    format!("{}{}", body, check)
}

pub async fn read_imei(port: &dyn AtPort, timeout: Duration) -> Result<String, ModemError> {
    let response = port.send("AT+CGSN", timeout).await?;
    parse_imei(&response).ok_or_else(|| ModemError::Rejected {
        command: "AT+CGSN".to_string(),
        response: response.trim().to_string(),
    })
}

pub async fn write_imei(
    port: &dyn AtPort,
    imei: &str,
    timeout: Duration,
) -> Result<(), ModemError> {
    port.send(&format!("AT+SIMEI={}", imei), timeout).await?;
    Ok(())
}

/// Write-once store for the modem's original IMEI
#[derive(Debug, Clone)]
pub struct ImeiVault {
    path: PathBuf,
}

impl ImeiVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original(&self) -> Option<String> {
        fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Persist `imei` unless an original is already stored.
    /// Returns true when this call wrote the file.
    pub fn remember(&self, imei: &str) -> io::Result<bool> {
        if self.original().is_some() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{}\n", imei))?;
        info!("  Original IMEI saved to {}", self.path.display());
        Ok(true)
    }

    /// Read the current IMEI and compare against the stored original,
    /// recording it first if nothing is stored yet.
    pub async fn audit(&self, port: &dyn AtPort, timeout: Duration) -> ImeiStatus {
        let current = match read_imei(port, timeout).await {
            Ok(imei) => Some(imei),
            Err(e) => {
                warn!("  IMEI read failed: {}", e);
                None
            }
        };

        if let Some(imei) = &current {
            if let Err(e) = self.remember(imei) {
                warn!("  Could not persist original IMEI: {}", e);
            }
        }

        let original = self.original();
        let changed = matches!((&original, &current), (Some(o), Some(c)) if o != c);
        ImeiStatus {
            original,
            current,
            changed,
        }
    }
}
