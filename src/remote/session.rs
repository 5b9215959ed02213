//! SSH-based command execution on the device under test.
//!
//! This module provides the `RemoteSession` for running commands on the
//! booted device. Every call spawns a fresh `ssh` process; there is no
//! persistent connection object, so a device reboot between calls needs no
//! special handling on this side.

use crate::config::{expand_path, DeviceConfig};
use crate::error::{Error, Result};
use log::{debug, info};
use std::cell::Cell;
use std::path::PathBuf;
use std::process::{Child, Command};

/// Exit status the OpenSSH client reserves for its own failures.
///
/// A remote command could legitimately exit with 255 as well; the two cases
/// are indistinguishable at the process boundary. We deliberately classify
/// 255 as a channel-level connection failure and report it as
/// [`Error::Connection`], so it never surfaces as an `ExecutionResult` exit
/// code.
const SSH_CHANNEL_FAILURE: i32 = 255;

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Exit code (0 for success)
    pub exit_code: i32,
}

impl ExecutionResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for a single [`RemoteSession::run`] invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Fail the call when the remote command exits non-zero
    pub check: bool,
    /// Log the command before running it
    pub echo: bool,
    /// Suppress logging of the captured stdout/stderr
    pub quiet: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            check: true,
            echo: true,
            quiet: false,
        }
    }
}

impl RunOptions {
    /// Options for reachability probes: tolerate nothing, log nothing.
    pub fn probe() -> Self {
        Self {
            check: true,
            echo: false,
            quiet: true,
        }
    }

    /// Options for best-effort commands whose exit code the caller inspects.
    pub fn tolerant() -> Self {
        Self {
            check: false,
            ..Default::default()
        }
    }
}

/// SSH session to a single device.
///
/// The host/user/port triple is fixed at construction. The connection
/// timeout is interiorly mutable so the retry driver can temporarily lower
/// it through a shared reference while a device boots.
pub struct RemoteSession {
    host: String,
    user: String,
    port: u16,
    connect_timeout: Cell<u64>,
    key_file: Option<PathBuf>,
}

impl RemoteSession {
    /// Creates a session for the given endpoint with the default timeout.
    pub fn new(host: &str, user: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            connect_timeout: Cell::new(60),
            key_file: None,
        }
    }

    /// Creates a session from a device configuration.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            host: config.host.clone(),
            user: config.user.clone(),
            port: config.port,
            connect_timeout: Cell::new(config.connect_timeout),
            key_file: config.ssh_key.as_deref().map(expand_path),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connect_timeout(&self) -> u64 {
        self.connect_timeout.get()
    }

    pub fn set_connect_timeout(&self, seconds: u64) {
        self.connect_timeout.set(seconds);
    }

    pub fn key_file(&self) -> Option<&PathBuf> {
        self.key_file.as_ref()
    }

    /// SSH client arguments shared by every invocation.
    ///
    /// Host keys change on every image rebuild, so host-key verification and
    /// the known-hosts file are disabled.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(key) = &self.key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        args.extend([
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.get()),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            format!("{}@{}", self.user, self.host),
        ]);

        args
    }

    /// Executes a command on the device and captures its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the channel could not be
    /// established (ssh itself exited with 255), or [`Error::Command`] if
    /// the remote command exited non-zero and `options.check` is set.
    pub fn run(&self, command: &str, options: &RunOptions) -> Result<ExecutionResult> {
        if options.echo {
            info!("[{}] {}", self.host, command);
        }

        let output = Command::new("ssh")
            .args(self.ssh_args())
            .arg(command)
            .output()
            .map_err(Error::Io)?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if exit_code == SSH_CHANNEL_FAILURE {
            return Err(Error::Connection(format!(
                "ssh to {}@{}:{} failed: {}",
                self.user,
                self.host,
                self.port,
                stderr.trim()
            )));
        }

        if !options.quiet {
            if !stdout.is_empty() {
                info!("{}", stdout.trim_end());
            }
            if !stderr.is_empty() {
                info!("{}", stderr.trim_end());
            }
        }

        if options.check && exit_code != 0 {
            return Err(Error::Command {
                exit_code,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Starts a long-running command on the device and returns the live
    /// process handle instead of waiting for completion.
    pub fn spawn(&self, command: &str) -> Result<Child> {
        debug!("[{}] spawning: {}", self.host, command);

        Command::new("ssh")
            .args(self.ssh_args())
            .arg(command)
            .spawn()
            .map_err(Error::Io)
    }
}

/// Executes a shell command on the controlling host itself.
///
/// Used for image manipulation steps that happen on the machine running the
/// test suite, not on the device.
pub fn run_local(command: &str, check: bool) -> Result<ExecutionResult> {
    info!("(local) {}", command);

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(Error::Io)?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if check && exit_code != 0 {
        return Err(Error::Command {
            exit_code,
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(ExecutionResult {
        stdout,
        stderr,
        exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_result_is_success() {
        let success = ExecutionResult {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(success.is_success());

        let failure = ExecutionResult {
            stdout: String::new(),
            stderr: "error".to_string(),
            exit_code: 1,
        };
        assert!(!failure.is_success());
    }

    #[test]
    fn test_ssh_args_disable_host_key_checks() {
        let session = RemoteSession::new("localhost", "root", 8822);
        let args = session.ssh_args();

        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"8822".to_string()));
        assert_eq!(args.last().unwrap(), "root@localhost");
    }

    #[test]
    fn test_ssh_args_include_key_file() {
        let config = DeviceConfig::new("localhost".to_string())
            .with_ssh_key("/keys/test_rsa".to_string());
        let session = RemoteSession::from_config(&config);
        let args = session.ssh_args();

        let pos = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[pos + 1], "/keys/test_rsa");
    }

    #[test]
    fn test_connect_timeout_is_interiorly_mutable() {
        let session = RemoteSession::new("localhost", "root", 8822);
        assert_eq!(session.connect_timeout(), 60);

        session.set_connect_timeout(5);
        assert_eq!(session.connect_timeout(), 5);
        assert!(session
            .ssh_args()
            .contains(&"ConnectTimeout=5".to_string()));
    }

    #[test]
    fn test_run_local_captures_output() {
        let result = run_local("echo hello", true).unwrap();
        assert!(result.is_success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_local_check_failure() {
        let err = run_local("exit 3", true).unwrap_err();
        match err {
            Error::Command { exit_code, .. } => assert_eq!(exit_code, 3),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_run_local_tolerated_failure() {
        let result = run_local("exit 3", false).unwrap();
        assert_eq!(result.exit_code, 3);
    }
}
