//! CLI commands for manual device bring-up and debugging.

pub mod boot;
pub mod clean_state;
pub mod image;
pub mod probe;
pub mod pull;
pub mod push;
pub mod run;

use clap::Args;

use crate::config::{worker_ssh_port, DeviceConfig};
use crate::remote::RemoteSession;

/// Device connection flags shared by the commands that talk to a device.
#[derive(Args)]
pub struct SessionArgs {
    #[arg(long, default_value = "localhost", help = "Device host")]
    pub host: String,

    #[arg(long, default_value = "root", help = "SSH user on the device")]
    pub user: String,

    #[arg(long, help = "SSH port (defaults to the worker-offset base port)")]
    pub port: Option<u16>,

    #[arg(long, help = "SSH private key file")]
    pub ssh_key: Option<String>,

    #[arg(long, default_value_t = 60, help = "Connection timeout in seconds")]
    pub connect_timeout: u64,
}

impl SessionArgs {
    pub fn to_config(&self) -> DeviceConfig {
        let mut config = DeviceConfig::new(self.host.clone())
            .with_user(self.user.clone())
            .with_port(self.port.unwrap_or_else(worker_ssh_port))
            .with_connect_timeout(self.connect_timeout);
        if let Some(key) = &self.ssh_key {
            config = config.with_ssh_key(key.clone());
        }
        config
    }

    pub fn to_session(&self) -> RemoteSession {
        RemoteSession::from_config(&self.to_config())
    }
}
