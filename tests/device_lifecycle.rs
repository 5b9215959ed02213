use otarig::device::{pid_exists, DeviceInstance};
use otarig::error::Error;
use otarig::remote::{RemoteSession, RetryPolicy};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Writes a stand-in qemu wrapper that records its pid and then idles,
/// the way a real emulator process would.
fn write_fake_wrapper(dir: &Path, pidfile: &Path) -> std::path::PathBuf {
    let wrapper = dir.join("qemu-wrapper");
    fs::write(
        &wrapper,
        format!("#!/bin/sh\necho $$ > {}\nexec sleep 600\n", pidfile.display()),
    )
    .unwrap();

    let mut perms = fs::metadata(&wrapper).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&wrapper, perms).unwrap();

    wrapper
}

#[test]
fn failed_launch_leaves_no_process_and_no_image() {
    let scratch = TempDir::new().unwrap();
    let build_dir = scratch.path().join("build");
    fs::create_dir_all(&build_dir).unwrap();
    fs::write(build_dir.join("core-image-full.sdimg"), b"rootfs").unwrap();

    // Route disposable copies into a directory we can inspect afterwards.
    let image_spool = TempDir::new().unwrap();
    std::env::set_var("TMPDIR", image_spool.path());

    let pidfile = scratch.path().join("wrapper.pid");
    let wrapper = write_fake_wrapper(scratch.path(), &pidfile);

    // Nothing answers SSH on port 1, so the reachability wait must fail.
    let session = RemoteSession::new("127.0.0.1", "nobody", 1);
    let policy = RetryPolicy {
        deadline: Duration::from_millis(500),
        backoff: Duration::from_millis(50),
        probe_timeout: 1,
    };

    let result = DeviceInstance::launch(&wrapper, &build_dir, session, &policy);
    std::env::remove_var("TMPDIR");

    match result {
        Err(Error::Launch(_)) | Err(Error::Io(_)) => {}
        Err(other) => panic!("unexpected error kind: {}", other),
        Ok(_) => panic!("launch succeeded against a dead endpoint"),
    }

    // The wrapper ran and was torn down again.
    let pid: u32 = fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!pid_exists(pid), "wrapper process still running");

    // No disposable image left behind.
    let leftovers: Vec<_> = fs::read_dir(image_spool.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("test-image-"))
        .collect();
    assert!(leftovers.is_empty(), "disposable images left: {:?}", leftovers);
}

#[test]
fn launch_fails_cleanly_without_boot_image() {
    let scratch = TempDir::new().unwrap();
    let build_dir = scratch.path().join("build");
    fs::create_dir_all(&build_dir).unwrap();

    let pidfile = scratch.path().join("wrapper.pid");
    let wrapper = write_fake_wrapper(scratch.path(), &pidfile);

    let session = RemoteSession::new("127.0.0.1", "nobody", 1);
    let policy = RetryPolicy {
        deadline: Duration::from_millis(200),
        backoff: Duration::from_millis(50),
        probe_timeout: 1,
    };

    let result = DeviceInstance::launch(&wrapper, &build_dir, session, &policy);

    match result {
        Err(Error::Launch(msg)) => assert!(msg.contains("no supported boot image")),
        other => panic!("expected launch failure, got {:?}", other.map(|_| ())),
    }

    // The wrapper must never have been started.
    assert!(!pidfile.exists());
}
