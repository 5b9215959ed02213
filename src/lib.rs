//! Acceptance-test rig for embedded OTA update clients.
//!
//! `otarig` boots a QEMU-emulated device from a disposable copy of a
//! Yocto-built disk image, establishes an SSH command channel to it, and
//! tears the device down deterministically when the test is over. It also
//! provides the readers-writer lock used to serialize tests that cannot
//! share the device, and helpers to reset persisted updater state on the
//! device between test cases.
//!
//! The crate is consumed by integration-test binaries; the `otarig` CLI
//! wraps the same building blocks for manual device bring-up and debugging.

pub mod buildenv;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod lock;
pub mod remote;

pub use error::{Error, Result};
