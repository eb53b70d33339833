//! Error types for rotord.
//!
//! Drivers, the probe and the routing guard return these instead of
//! swallowing failures, so the orchestrator's retry ladder sees exactly
//! what went wrong.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },
}

#[derive(Error, Debug)]
pub enum ModemError {
    #[error("No AT command port found")]
    PortNotFound,

    #[error("AT port I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("AT port configuration failed on {port}: {message}")]
    Termios { port: String, message: String },

    #[error("Modem rejected '{command}': {response}")]
    Rejected { command: String, response: String },

    #[error("No final result for '{command}' within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("Modem did not come back: {0}")]
    NotReady(String),
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Bring-up failed: {0}")]
    BringUp(String),

    #[error("Device node missing: {0}")]
    MissingDevice(String),

    #[error("No {0} interface present")]
    NoInterface(&'static str),

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    Modem(#[from] ModemError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Could not parse route: {0}")]
    Parse(String),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook answered {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Webhook reply had no message id")]
    MissingId,
}
