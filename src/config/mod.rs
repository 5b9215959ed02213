//! Configuration management for the test rig.
//!
//! This module handles loading and saving rig configuration (device
//! connection parameters, qemu wrapper location, build directory) and the
//! worker-index plumbing that keeps parallel test workers from colliding on
//! network ports.
//!
//! # Configuration File Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/otarig/config.yml`
//! - macOS: `~/Library/Application Support/otarig/config.yml`
//!
//! # Example Configuration
//!
//! ```yaml
//! device:
//!   host: "localhost"
//!   user: "root"
//!   connect_timeout: 60
//!   ssh_key: "~/.ssh/id_rsa"
//! qemu_wrapper: "/opt/rig/scripts/qemu-wrapper"
//! build_dir: "/home/builder/yocto/build"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Base SSH forward port for the first worker; worker N uses base + N.
pub const SSH_PORT_BASE: u16 = 8822;

/// Base VNC display for the first worker; worker N uses base + N.
pub const VNC_DISPLAY_BASE: u16 = 23;

/// Base port for the artifact HTTP server the device downloads from.
pub const HTTP_PORT_BASE: u16 = 8000;

/// Default SSH connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT: u64 = 60;

/// Default login user on the device images.
const DEFAULT_USER: &str = "root";

/// Default device host (QEMU user-mode networking forwards to localhost).
const DEFAULT_HOST: &str = "localhost";

/// Top-level configuration for the rig.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RigConfig {
    /// Connection parameters for the emulated device
    #[serde(default)]
    pub device: DeviceConfig,

    /// Path to the qemu wrapper script used to launch the device
    pub qemu_wrapper: Option<PathBuf>,

    /// Yocto build output directory searched for boot images
    pub build_dir: Option<PathBuf>,
}

/// Connection parameters for a single emulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Hostname or IP address the SSH forward is bound to
    #[serde(default = "default_host")]
    pub host: String,

    /// SSH login user on the device
    #[serde(default = "default_user")]
    pub user: String,

    /// SSH forward port; defaults to the worker-offset base port
    #[serde(default = "worker_ssh_port")]
    pub port: u16,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Path to SSH private key file (optional)
    pub ssh_key: Option<String>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            user: default_user(),
            port: worker_ssh_port(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ssh_key: None,
        }
    }
}

impl RigConfig {
    /// Returns the default configuration file path for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("otarig").join("config.yml"))
    }

    /// Loads configuration from the default location.
    ///
    /// Returns `Ok(RigConfig::default())` if no config file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(RigConfig::default()),
        }
    }

    /// Loads configuration from a specific file path.
    ///
    /// Returns `Ok(RigConfig::default())` if the file doesn't exist.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(RigConfig::default());
        }

        let contents = fs::read_to_string(path).map_err(Error::Io)?;
        let config: RigConfig = serde_yaml::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(config)
    }

    /// Saves configuration to a specific file path.
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let contents = serde_yaml::to_string(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;

        fs::write(path, contents).map_err(Error::Io)?;
        Ok(())
    }
}

impl DeviceConfig {
    /// Creates a device configuration with the given host, using defaults
    /// for everything else.
    pub fn new(host: String) -> Self {
        Self {
            host,
            ..Default::default()
        }
    }

    /// Builder method to set the SSH user.
    pub fn with_user(mut self, user: String) -> Self {
        self.user = user;
        self
    }

    /// Builder method to set the SSH port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder method to set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: u64) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder method to set the SSH key path.
    pub fn with_ssh_key(mut self, key_path: String) -> Self {
        self.ssh_key = Some(key_path);
        self
    }

    /// Returns the SSH connection string (user@host:port).
    pub fn connection_string(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Expands the SSH key path, replacing ~ with the home directory.
    pub fn expanded_ssh_key(&self) -> Option<PathBuf> {
        self.ssh_key.as_ref().map(|key| expand_path(key))
    }
}

/// Expands ~ in paths to the home directory.
pub(crate) fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Zero-based index of the current test worker.
///
/// Parallel test runners export `OTARIG_WORKER` (e.g. `w0`, `w1`) so each
/// worker gets its own SSH/VNC port window. Without it, a single worker with
/// index 0 is assumed.
pub fn worker_index() -> usize {
    parse_worker_index(env::var("OTARIG_WORKER").ok().as_deref())
}

/// Number of parallel test workers, from `OTARIG_WORKER_COUNT`.
pub fn worker_count() -> usize {
    env::var("OTARIG_WORKER_COUNT")
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(1)
}

fn parse_worker_index(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return 0;
    };

    // The worker name carries a trailing numeric index (`w3` -> 3).
    let digits: String = raw
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    digits.parse().unwrap_or(0)
}

/// SSH forward port for the current worker.
pub fn worker_ssh_port() -> u16 {
    SSH_PORT_BASE + worker_index() as u16
}

/// VNC display number for the current worker.
pub fn worker_vnc_display() -> u16 {
    VNC_DISPLAY_BASE + worker_index() as u16
}

/// Artifact HTTP server port for the current worker.
pub fn worker_http_port() -> u16 {
    HTTP_PORT_BASE + worker_index() as u16
}
