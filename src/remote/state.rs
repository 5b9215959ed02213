//! On-device updater state reset between test cases.
//!
//! Each test expects the device in a first-boot-like state. Rather than a
//! full reboot, the cleaner removes the updater's persisted files, and the
//! bootloader-environment helpers clear the boot-count/upgrade-pending
//! flags an interrupted update may have left behind.

use crate::error::Result;
use crate::remote::session::{RemoteSession, RunOptions};
use log::debug;

/// Persisted updater state removed between test cases: the device
/// credential, the key-value store, and the store's lock file.
pub const UPDATER_STATE_FILES: [&str; 3] = [
    "/var/lib/updater/updater-agent.pem",
    "/var/lib/updater/updater-store",
    "/var/lib/updater/updater-store-lock",
];

fn removal_command() -> String {
    format!("rm -f {}", UPDATER_STATE_FILES.join(" "))
}

/// Removes the updater's persisted state files, tolerating their absence.
pub fn clear_updater_state(session: &RemoteSession) -> Result<()> {
    session.run(&removal_command(), &RunOptions::default())?;
    Ok(())
}

/// Bootloader-environment tool pair present on the device.
///
/// Detected once per device and carried as data; GRUB images ship a
/// dedicated wrapper pair, everything else uses the u-boot tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderTools {
    Grub,
    Uboot,
}

impl BootloaderTools {
    /// Probes the device for the GRUB environment wrapper and picks the
    /// tool pair accordingly.
    pub fn detect(session: &RemoteSession) -> Result<Self> {
        let result = session.run(
            "test -x /usr/bin/grub-updater-env-print",
            &RunOptions {
                check: false,
                echo: false,
                quiet: true,
            },
        )?;

        let tools = if result.is_success() {
            BootloaderTools::Grub
        } else {
            BootloaderTools::Uboot
        };

        debug!("detected bootloader tools: {:?}", tools);
        Ok(tools)
    }

    /// Name of the environment print tool.
    pub fn print_tool(&self) -> &'static str {
        match self {
            BootloaderTools::Grub => "grub-updater-env-print",
            BootloaderTools::Uboot => "fw_printenv",
        }
    }

    /// Name of the environment set tool.
    pub fn set_tool(&self) -> &'static str {
        match self {
            BootloaderTools::Grub => "grub-updater-env-set",
            BootloaderTools::Uboot => "fw_setenv",
        }
    }
}

/// Clears the upgrade-pending flag and boot counter so the device boots
/// the active partition predictably on the next restart.
pub fn commit_boot_state(session: &RemoteSession, tools: BootloaderTools) -> Result<()> {
    session.run(
        &format!("{} upgrade_available 0", tools.set_tool()),
        &RunOptions::default(),
    )?;
    session.run(
        &format!("{} bootcount 0", tools.set_tool()),
        &RunOptions::default(),
    )?;
    Ok(())
}
