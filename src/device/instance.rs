//! Lifecycle of a single emulated device instance.
//!
//! An instance owns the qemu wrapper process, the disposable copy of the
//! boot image it runs from, and the SSH session bound to it. Launch and
//! teardown are modeled as an explicit state machine so teardown runs
//! exactly once, no matter how the test ends.

use crate::config::{worker_index, worker_ssh_port, worker_vnc_display};
use crate::device::artifact::{find_boot_image, BootImage};
use crate::error::{Error, Result};
use crate::remote::retry::{wait_for_device, RetryPolicy};
use crate::remote::session::{RemoteSession, RunOptions};
use crate::remote::state::{commit_boot_state, BootloaderTools};
use crate::remote::transfer::ScpTransfer;
use log::{debug, info, warn};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

/// Machine name the wrapper expects for raw NOR-flash boots.
const FLASH_MACHINE: &str = "vexpress-qemu-flash";

/// Where collected device logs are staged on the device before transfer.
const REMOTE_LOG_PATH: &str = "/tmp/journalctl.log";

/// How long each of the power-off and kill phases may take.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval for process-exit checks during shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// Lifecycle states of a device instance. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Launching,
    Reachable,
    ShuttingDown,
    Terminated,
}

/// A booted emulated device.
///
/// Exactly one SSH session is bound to each instance, and the disposable
/// image is exclusively owned: it is deleted during teardown and the
/// original build artifact is never touched.
pub struct DeviceInstance {
    child: Child,
    image_path: PathBuf,
    session: RemoteSession,
    state: LifecycleState,
    log_destination: PathBuf,
}

impl DeviceInstance {
    /// Boots a device from the latest image in `build_dir` and waits for it
    /// to become reachable.
    ///
    /// The wrapper process is started in its own process group so the whole
    /// emulator tree can be signaled together, and with per-worker port and
    /// display offsets so parallel workers do not collide.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Launch`] if no boot image exists or the device
    /// never answers within the retry policy's deadline. On failure the
    /// just-started process is terminated and the disposable image removed;
    /// no partial state is left behind.
    pub fn launch(
        qemu_wrapper: &Path,
        build_dir: &Path,
        session: RemoteSession,
        policy: &RetryPolicy,
    ) -> Result<DeviceInstance> {
        let image = find_boot_image(build_dir)?;
        let disposable = make_disposable_copy(&image)?;

        let mut cmd = Command::new(qemu_wrapper);
        cmd.env("DISK_IMG", &disposable)
            .env("PORT_NUMBER", worker_ssh_port().to_string())
            .env("VNC_NUMBER", worker_vnc_display().to_string());
        if image.kind.is_flash() {
            info!("raw flash boot with image {}", disposable.display());
            cmd.env("MACHINE", FLASH_MACHINE);
        }
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_image_file(&disposable);
                return Err(Error::Launch(format!(
                    "failed to start {}: {}",
                    qemu_wrapper.display(),
                    e
                )));
            }
        };

        info!(
            "qemu started with pid {}, image {}",
            child.id(),
            disposable.display()
        );

        let mut instance = DeviceInstance {
            child,
            image_path: disposable,
            session,
            state: LifecycleState::Launching,
            log_destination: default_log_destination(),
        };

        match wait_for_device(&instance.session, "true", policy) {
            Ok(_) => {
                instance.state = LifecycleState::Reachable;
                Ok(instance)
            }
            Err(e) => {
                instance.abort_launch();
                Err(Error::Launch(format!(
                    "device never became reachable: {}",
                    e
                )))
            }
        }
    }

    /// The SSH session bound to this instance.
    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    /// Path of the disposable image the device runs from.
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Pid of the qemu wrapper process.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Overrides where collected device logs are written on teardown.
    pub fn set_log_destination(&mut self, path: PathBuf) {
        self.log_destination = path;
    }

    /// Tears the device down.
    ///
    /// Every step short of the final process reap is best-effort: its
    /// failure is logged as a warning and the remaining steps still run.
    /// Calling this on an already-terminated instance is a no-op, and the
    /// disposable image is never deleted twice.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == LifecycleState::Terminated {
            debug!("shutdown of already-terminated instance, nothing to do");
            return Ok(());
        }
        self.state = LifecycleState::ShuttingDown;

        if let Err(e) = self.collect_logs() {
            warn!("{}", e);
        }
        if let Err(e) = self.clear_boot_state() {
            warn!("{}", e);
        }
        if let Err(e) = self.try_poweroff() {
            warn!("{}", e);
        }

        let mut result = self.terminate_process_group();
        if result.is_ok() {
            result = self.child.wait().map_err(Error::Io).map(|_| ());
        }

        // The image is removed and the state advanced even when the reap
        // fails, so `Terminated` stays absorbing.
        remove_image_file(&self.image_path);
        self.state = LifecycleState::Terminated;

        result
    }

    /// Cleanup path for a launch whose reachability wait failed: kill what
    /// we just started and drop the disposable image before propagating.
    fn abort_launch(&mut self) {
        info!("terminating qemu wrapper with pid {}", self.child.id());

        if let Err(e) = signal_group(self.child.id(), libc::SIGTERM) {
            // The wrapper may have exited on its own already.
            debug!("could not signal qemu process group: {}", e);
        }
        if let Err(e) = self.child.wait() {
            warn!("could not reap qemu wrapper: {}", e);
        }

        remove_image_file(&self.image_path);
        self.state = LifecycleState::Terminated;
    }

    /// Copies the device's journal to the controlling host.
    fn collect_logs(&self) -> Result<()> {
        let step = |e: Error| Error::ShutdownStep {
            step: "collect-logs",
            reason: e.to_string(),
        };

        self.session
            .run(
                &format!("journalctl --no-pager > {}", REMOTE_LOG_PATH),
                &RunOptions::probe(),
            )
            .map_err(step)?;
        ScpTransfer::new(&self.session)
            .download(REMOTE_LOG_PATH, &self.log_destination)
            .map_err(step)?;

        info!(
            "device logs collected to {}",
            self.log_destination.display()
        );
        Ok(())
    }

    /// Clears boot-count/upgrade-pending state so the next boot from this
    /// image is predictable.
    fn clear_boot_state(&self) -> Result<()> {
        let step = |e: Error| Error::ShutdownStep {
            step: "clear-boot-state",
            reason: e.to_string(),
        };

        let tools = BootloaderTools::detect(&self.session).map_err(step)?;
        commit_boot_state(&self.session, tools).map_err(step)
    }

    /// Asks the device to power off and waits for the wrapper to exit.
    fn try_poweroff(&mut self) -> Result<()> {
        let step = |e: Error| Error::ShutdownStep {
            step: "poweroff",
            reason: e.to_string(),
        };

        self.session
            .run("poweroff", &RunOptions::tolerant())
            .map_err(step)?;

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while Instant::now() < deadline {
            if self.child.try_wait().map_err(Error::Io).map_err(step)?.is_some() {
                debug!("device powered off cleanly");
                return Ok(());
            }
            thread::sleep(SHUTDOWN_POLL);
        }

        Err(Error::ShutdownStep {
            step: "poweroff",
            reason: "device still running after power-off wait".to_string(),
        })
    }

    /// Signals the wrapper's process group until it is gone: one SIGTERM,
    /// then SIGKILL every poll interval.
    ///
    /// A no-such-process error means everything already exited and is
    /// swallowed; any other OS error is fatal.
    fn terminate_process_group(&mut self) -> Result<()> {
        if self.child.try_wait().map_err(Error::Io)?.is_some() {
            return Ok(());
        }

        let pid = self.child.id();
        match signal_group(pid, libc::SIGTERM) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL);
            if self.child.try_wait().map_err(Error::Io)?.is_some() {
                return Ok(());
            }
            match signal_group(pid, libc::SIGKILL) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(())
    }
}

impl Drop for DeviceInstance {
    fn drop(&mut self) {
        if self.state != LifecycleState::Terminated {
            if let Err(e) = self.shutdown() {
                warn!("teardown during drop failed: {}", e);
            }
        }
    }
}

/// Copies a boot image to a private path the instance may mutate and
/// delete. The suffix is preserved so the wrapper dispatches on it.
fn make_disposable_copy(image: &BootImage) -> Result<PathBuf> {
    let tmp = tempfile::Builder::new()
        .prefix("test-image-")
        .suffix(image.kind.extension())
        .tempfile()
        .map_err(Error::Io)?;
    let (_file, path) = tmp.keep().map_err(|e| Error::Io(e.error))?;

    if let Err(e) = fs::copy(&image.path, &path) {
        remove_image_file(&path);
        return Err(Error::Io(e));
    }

    debug!(
        "disposable copy of {} at {}",
        image.path.display(),
        path.display()
    );
    Ok(path)
}

/// Removes a disposable image, tolerating its absence.
fn remove_image_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed disposable image {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(
            "could not remove disposable image {}: {}",
            path.display(),
            e
        ),
    }
}

fn default_log_destination() -> PathBuf {
    env::temp_dir().join(format!("device-journal-w{}.log", worker_index()))
}

/// Returns true if a process with the given pid exists.
pub fn pid_exists(pid: u32) -> bool {
    let Ok(pid_t) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only an existence/permission check.
    unsafe { libc::kill(pid_t, 0) == 0 }
}

/// Sends `signal` to the process group led by `pid`.
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid_t = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: a negative pid targets the whole process group.
    if unsafe { libc::kill(-pid_t, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Determines the currently active and passive root partitions, in that
/// order, from the device's `mount` output and the configured A/B pair.
pub fn active_passive_parts(
    session: &RemoteSession,
    part_a: &str,
    part_b: &str,
) -> Result<(String, String)> {
    let mount = session.run("mount", &RunOptions::probe())?;

    if mount.stdout.contains(part_a) {
        Ok((part_a.to_string(), part_b.to_string()))
    } else if mount.stdout.contains(part_b) {
        Ok((part_b.to_string(), part_a.to_string()))
    } else {
        Err(Error::Config(format!(
            "could not determine active partition; neither {} nor {} is mounted",
            part_a, part_b
        )))
    }
}
