//! SSH control channel to the booted device.
//!
//! This module provides the command channel used to drive the device under
//! test: one-shot command execution, SCP file transfer for images whose SSH
//! server lacks an SFTP subsystem, the retry driver that waits for a
//! booting device to become reachable, and the cleaner that resets
//! persisted updater state between test cases.

pub mod retry;
pub mod session;
pub mod state;
pub mod transfer;

pub use retry::{reboot, retry_until_connected, wait_for_device, RetryPolicy, TimeoutOverride};
pub use session::{run_local, ExecutionResult, RemoteSession, RunOptions};
pub use state::{
    clear_updater_state, commit_boot_state, BootloaderTools, UPDATER_STATE_FILES,
};
pub use transfer::ScpTransfer;
