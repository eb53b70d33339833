//! Command runner - single subprocess layer for every OS tool rotord touches.
//!
//! `ip`, `qmicli`, `pppd`, DHCP clients, `iptables`, `mmcli` and `systemctl`
//! all go through [`CommandRunner`], so drivers and the probe can be
//! exercised against [`FakeRunner`] without hardware.

use crate::error::ShellError;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero exit into [`ShellError::NonZeroExit`]
    pub fn check(self, command: &str) -> Result<Self, ShellError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ShellError::NonZeroExit {
                command: command.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Render a command line for logs and errors
pub fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command, returning its output whatever the exit code
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, ShellError>;

    /// Whether a program is installed
    fn exists(&self, program: &str) -> bool;

    /// Run and require exit code 0
    async fn run_checked(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, ShellError> {
        let output = self.run(program, args, timeout).await?;
        output.check(&command_line(program, args))
    }
}

/// Runs real processes via tokio
pub struct RealRunner {
    sudo: bool,
}

impl RealRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }
}

#[async_trait]
impl CommandRunner for RealRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, ShellError> {
        let line = command_line(program, args);
        debug!("  Executing: {}", line);

        let mut command = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(program).args(args);
            c
        } else {
            let mut c = Command::new(program);
            c.args(args);
            c
        };

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|source| ShellError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(ShellError::Timeout {
                    command: line,
                    timeout,
                })
            }
        };

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

// ============================================================================
// Fake runner (testing)
// ============================================================================

#[derive(Debug, Clone)]
enum FakeReply {
    Output(CommandOutput),
    Timeout,
}

/// Scripted runner: replies are matched by command-line prefix, first match wins.
/// Unmatched commands succeed with empty output. Every call is recorded.
#[derive(Clone, Default)]
pub struct FakeRunner {
    replies: Arc<Mutex<Vec<(String, FakeReply)>>>,
    missing: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, stdout: &str) -> &Self {
        self.push(prefix, FakeReply::Output(CommandOutput::ok(stdout)));
        self
    }

    pub fn fail(&self, prefix: &str, code: i32, stderr: &str) -> &Self {
        self.push(prefix, FakeReply::Output(CommandOutput::failed(code, stderr)));
        self
    }

    pub fn time_out(&self, prefix: &str) -> &Self {
        self.push(prefix, FakeReply::Timeout);
        self
    }

    pub fn mark_missing(&self, program: &str) -> &Self {
        if let Ok(mut missing) = self.missing.lock() {
            missing.push(program.to_string());
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Index of the first recorded call starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    fn push(&self, prefix: &str, reply: FakeReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push((prefix.to_string(), reply));
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, ShellError> {
        let line = command_line(program, args);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }

        let reply = self.replies.lock().ok().and_then(|replies| {
            replies
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, reply)| reply.clone())
        });

        match reply {
            Some(FakeReply::Output(output)) => Ok(output),
            Some(FakeReply::Timeout) => Err(ShellError::Timeout {
                command: line,
                timeout,
            }),
            None => Ok(CommandOutput::default()),
        }
    }

    fn exists(&self, program: &str) -> bool {
        self.missing
            .lock()
            .map(|m| !m.iter().any(|p| p == program))
            .unwrap_or(true)
    }
}
