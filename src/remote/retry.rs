//! Retry-until-connected driver for booting and rebooting devices.
//!
//! A device that was just launched (or told to reboot) takes a while to
//! answer SSH. This module polls the channel until it comes up or a
//! deadline passes, retrying only channel-level connection failures;
//! anything else propagates immediately.

use crate::error::{Error, Result};
use crate::remote::session::{RemoteSession, RunOptions};
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Grace period after issuing `reboot` before probing the channel again.
const REBOOT_GRACE: Duration = Duration::from_secs(5);

/// Policy for the retry driver.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total time to keep trying before giving up
    pub deadline: Duration,
    /// Fixed wait between failed connection attempts
    pub backoff: Duration,
    /// Connection timeout applied to each individual probe, so a single
    /// attempt cannot consume the whole deadline
    pub probe_timeout: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(360),
            backoff: Duration::from_secs(30),
            probe_timeout: 60,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with a custom deadline and default backoff.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            ..Default::default()
        }
    }
}

/// Scoped override of a session's connection timeout.
///
/// Restores the original value when dropped, on every exit path.
pub struct TimeoutOverride<'a> {
    session: &'a RemoteSession,
    original: u64,
}

impl<'a> TimeoutOverride<'a> {
    pub fn new(session: &'a RemoteSession, seconds: u64) -> Self {
        let original = session.connect_timeout();
        session.set_connect_timeout(seconds);
        Self { session, original }
    }
}

impl Drop for TimeoutOverride<'_> {
    fn drop(&mut self) {
        self.session.set_connect_timeout(self.original);
    }
}

/// Repeats `attempt` until it succeeds or the policy deadline elapses.
///
/// Only [`Error::Connection`] is treated as transient: the driver waits one
/// backoff interval and tries again. Any other error kind propagates
/// immediately. When the deadline runs out, the last observed connection
/// error is returned.
pub fn retry_until_connected<T, F>(policy: &RetryPolicy, mut attempt: F, what: &str) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let deadline = Instant::now() + policy.deadline;
    let mut last_error: Option<Error> = None;

    while Instant::now() < deadline {
        debug!("trying to connect to {}", what);

        match attempt() {
            Ok(value) => return Ok(value),
            Err(e @ Error::Connection(_)) => {
                warn!("connection to {} failed: {}", what, e);
                last_error = Some(e);
                thread::sleep(policy.backoff);
            }
            Err(e) => {
                warn!("giving up on {}: {}", what, e);
                return Err(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::Connection(format!(
            "deadline elapsed before a connection attempt to {} completed",
            what
        ))
    }))
}

/// Waits until the device answers `command` over SSH.
///
/// While polling, the session's connection timeout is lowered to the
/// policy's probe timeout and restored afterwards regardless of outcome.
/// Returns the probe command's stdout on success.
pub fn wait_for_device(session: &RemoteSession, command: &str, policy: &RetryPolicy) -> Result<String> {
    let _guard = TimeoutOverride::new(session, policy.probe_timeout);

    info!("waiting for {} to become reachable", session.host());

    let result = retry_until_connected(
        policy,
        || session.run(command, &RunOptions::probe()),
        session.host(),
    )?;

    Ok(result.stdout)
}

/// Reboots the device and waits for it to come back.
///
/// Fast boards can drop the channel before `reboot` returns, so the command
/// itself is best-effort; the subsequent probe is what decides success.
pub fn reboot(session: &RemoteSession, policy: &RetryPolicy) -> Result<()> {
    if let Err(e) = session.run("reboot", &RunOptions::tolerant()) {
        debug!("reboot command dropped the channel early: {}", e);
    }

    thread::sleep(REBOOT_GRACE);

    wait_for_device(session, "true", policy)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(deadline_ms: u64, backoff_ms: u64) -> RetryPolicy {
        RetryPolicy {
            deadline: Duration::from_millis(deadline_ms),
            backoff: Duration::from_millis(backoff_ms),
            probe_timeout: 1,
        }
    }

    #[test]
    fn test_success_on_first_attempt() {
        let policy = fast_policy(1000, 10);
        let mut calls = 0;

        let result = retry_until_connected(
            &policy,
            || {
                calls += 1;
                Ok::<i32, Error>(42)
            },
            "test-device",
        );

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_success_after_connection_failures() {
        let policy = fast_policy(5000, 5);
        let mut calls = 0;

        let result = retry_until_connected(
            &policy,
            || {
                calls += 1;
                if calls < 3 {
                    Err(Error::Connection("not yet".to_string()))
                } else {
                    Ok(7)
                }
            },
            "test-device",
        );

        assert_eq!(result.unwrap(), 7);
        // Exactly N attempts for success on the Nth try.
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_deadline_bounds() {
        let policy = fast_policy(100, 20);
        let start = Instant::now();

        let result = retry_until_connected(
            &policy,
            || Err::<(), Error>(Error::Connection("down".to_string())),
            "test-device",
        );

        let elapsed = start.elapsed();
        assert!(result.is_err());
        // No earlier than the deadline, no more than one backoff late
        // (plus scheduling slack).
        assert!(elapsed >= policy.deadline);
        assert!(elapsed < policy.deadline + policy.backoff + Duration::from_millis(50));

        match result.unwrap_err() {
            Error::Connection(msg) => assert_eq!(msg, "down"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_non_connection_error_propagates_immediately() {
        let policy = fast_policy(5000, 1000);
        let mut calls = 0;
        let start = Instant::now();

        let result = retry_until_connected(
            &policy,
            || {
                calls += 1;
                Err::<(), Error>(Error::Command {
                    exit_code: 1,
                    stderr: "boom".to_string(),
                })
            },
            "test-device",
        );

        assert!(result.is_err());
        assert_eq!(calls, 1);
        // No backoff wait for non-transient errors.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_timeout_override_restores_on_drop() {
        let session = RemoteSession::new("localhost", "root", 8822);
        session.set_connect_timeout(360);

        {
            let _guard = TimeoutOverride::new(&session, 60);
            assert_eq!(session.connect_timeout(), 60);
        }

        assert_eq!(session.connect_timeout(), 360);
    }

    #[test]
    fn test_timeout_override_restores_on_early_return() {
        let session = RemoteSession::new("localhost", "root", 8822);

        fn failing_probe(session: &RemoteSession) -> Result<()> {
            let _guard = TimeoutOverride::new(session, 1);
            Err(Error::Connection("unreachable".to_string()))
        }

        assert!(failing_probe(&session).is_err());
        assert_eq!(session.connect_timeout(), 60);
    }
}
