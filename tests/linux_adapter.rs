//! Linux adapter integration tests using loopback devices.
//!
//! Most tests require root privileges and Linux-specific tools (losetup, mkfs.ext4).
//!
//! Run all tests: `cargo test --test linux_adapter`
//! Run ignored tests: `sudo cargo test --test linux_adapter -- --ignored`

#![cfg(target_os = "linux")]

use bkmirror::adapters::LinuxAdapter;
use bkmirror::core::DriveAdapter;
use nix::unistd::Uid;
use std::path::Path;
use std::process::Command;
use tempfile::{NamedTempFile, tempdir};

fn is_root() -> bool {
    Uid::effective().is_root()
}

fn has_tool(name: &str, arg: &str) -> bool {
    Command::new(name).arg(arg).output().is_ok()
}

/// Create a loopback device from a temp file, formatted with ext4.
/// Returns the loop device path (e.g., /dev/loop0) on success.
fn setup_loopback(file_path: &str, size_mb: u64) -> Option<String> {
    let result = Command::new("dd")
        .args([
            "if=/dev/zero",
            &format!("of={}", file_path),
            "bs=1M",
            &format!("count={}", size_mb),
        ])
        .output()
        .ok()?;
    if !result.status.success() {
        eprintln!("dd failed: {}", String::from_utf8_lossy(&result.stderr));
        return None;
    }

    let result = Command::new("mkfs.ext4")
        .args(["-F", "-q", "-L", "BKTEST", file_path])
        .output()
        .ok()?;
    if !result.status.success() {
        eprintln!(
            "mkfs.ext4 failed: {}",
            String::from_utf8_lossy(&result.stderr)
        );
        return None;
    }

    let output = Command::new("losetup")
        .args(["--find", "--show", file_path])
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        eprintln!(
            "losetup failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        None
    }
}

fn teardown_loopback(loop_device: &str) {
    let _ = Command::new("losetup").args(["-d", loop_device]).output();
}

#[test]
fn enumerates_block_devices() {
    if !has_tool("lsblk", "--version") {
        eprintln!("Skipping: lsblk not available");
        return;
    }
    let adapter = LinuxAdapter::new();
    let tree = adapter.block_devices();
    assert!(tree.is_ok(), "lsblk should parse: {:?}", tree.err());

    // Whatever is attached, the disk holding `/` is never a candidate.
    let tree = tree.unwrap();
    for drive in tree.candidates() {
        assert_ne!(drive.mount_point.as_deref(), Some(Path::new("/")));
    }
}

#[test]
fn reports_usage_of_root() {
    let usage = LinuxAdapter::new().usage(Path::new("/")).unwrap();
    assert!(usage.total > 0);
    assert!(usage.used <= usage.total);
}

#[test]
#[ignore = "requires root privileges and losetup/mkfs.ext4"]
fn mounts_and_unmounts_loopback_device() {
    if !is_root() {
        eprintln!("Skipping: requires root");
        return;
    }
    if !has_tool("losetup", "--version") || !has_tool("mkfs.ext4", "-V") {
        eprintln!("Skipping: losetup or mkfs.ext4 not available");
        return;
    }

    let image = NamedTempFile::new().expect("create temp file");
    let image_path = image.path().to_string_lossy().to_string();
    let Some(loop_device) = setup_loopback(&image_path, 32) else {
        eprintln!("Failed to setup loopback device");
        return;
    };

    let adapter = LinuxAdapter::new();
    let target = tempdir().unwrap();

    let mounted = adapter.mount(Path::new(&loop_device), target.path());
    let written = mounted
        .as_ref()
        .ok()
        .map(|_| std::fs::write(target.path().join("probe"), b"ok"));
    let usage = adapter.usage(target.path());
    let unmounted = adapter.unmount(target.path());

    teardown_loopback(&loop_device);

    mounted.expect("mount loopback");
    written.expect("mounted").expect("write probe");
    assert!(usage.expect("usage").total > 0);
    unmounted.expect("unmount loopback");
    assert!(!target.path().join("probe").exists());
}
