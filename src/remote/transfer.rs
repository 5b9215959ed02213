//! SCP-based file transfer to and from the device.
//!
//! Device images ship a minimal SSH server without an SFTP subsystem, so
//! transfers use plain `scp -O` with the same host-key-disabling options as
//! the command channel.

use crate::error::{Error, Result};
use crate::remote::session::RemoteSession;
use log::debug;
use std::path::Path;
use std::process::Command;

/// Handles SCP transfers for one device session.
pub struct ScpTransfer<'a> {
    session: &'a RemoteSession,
}

impl<'a> ScpTransfer<'a> {
    /// Creates a transfer handler bound to the given session.
    pub fn new(session: &'a RemoteSession) -> Self {
        Self { session }
    }

    /// Copies a local file to the device.
    pub fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let mut cmd = self.scp_command();
        cmd.arg(local);
        cmd.arg(self.remote_spec(remote));
        self.run_scp(cmd, "upload")
    }

    /// Copies a file from the device to the controlling host.
    pub fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let mut cmd = self.scp_command();
        cmd.arg(self.remote_spec(remote));
        cmd.arg(local);
        self.run_scp(cmd, "download")
    }

    /// Recursively copies a local directory to the device.
    pub fn upload_recursive(&self, local: &Path, remote: &str) -> Result<()> {
        let mut cmd = self.scp_command();
        cmd.arg("-r");
        cmd.arg(local);
        cmd.arg(self.remote_spec(remote));
        self.run_scp(cmd, "upload")
    }

    /// Builds the `scp` invocation shared by every transfer.
    ///
    /// `-O` forces the legacy SCP protocol; the SFTP-based default cannot
    /// talk to the device's SSH server. Note that scp takes the port as
    /// `-P`, not `-p`.
    fn scp_command(&self) -> Command {
        let mut cmd = Command::new("scp");

        cmd.arg("-O");
        cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
        cmd.arg("-o").arg("StrictHostKeyChecking=no");
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.session.connect_timeout()));

        if let Some(key) = self.session.key_file() {
            cmd.arg("-i").arg(key);
        }

        cmd.arg("-P").arg(self.session.port().to_string());

        cmd
    }

    fn remote_spec(&self, path: &str) -> String {
        format!(
            "{}@{}:{}",
            self.session.user(),
            self.session.host(),
            path
        )
    }

    fn run_scp(&self, mut cmd: Command, direction: &str) -> Result<()> {
        debug!("scp {} via port {}", direction, self.session.port());

        let output = cmd.output().map_err(Error::Io)?;
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code == 0 {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);

        // scp shares the ssh client's convention of exiting 255 when the
        // channel itself could not be established.
        if exit_code == 255 {
            return Err(Error::Connection(format!(
                "scp {} to {}@{}:{} failed: {}",
                direction,
                self.session.user(),
                self.session.host(),
                self.session.port(),
                stderr.trim()
            )));
        }

        Err(Error::Command {
            exit_code,
            stderr: format!("scp {} failed: {}", direction, stderr.trim()),
        })
    }
}
