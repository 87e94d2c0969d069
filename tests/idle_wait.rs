//! Idle-wait behavior: immediate return when active, bounded-latency early
//! wake on signal.

use std::fs;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;

fn town() -> (tempfile::TempDir, std::path::PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("town");
    fs::create_dir_all(root.join("settings")).unwrap();
    fs::create_dir_all(root.join("daemon")).unwrap();
    fs::write(root.join("settings/town.json"), "{}").unwrap();
    (tmp, root)
}

#[test]
fn returns_immediately_when_active() {
    let (_tmp, root) = town();
    fs::write(
        root.join("daemon/idle-state.json"),
        r#"{"idle": false, "polecat_count": 2, "convoy_count": 1}"#,
    )
    .unwrap();

    let start = Instant::now();
    Command::cargo_bin("gt")
        .unwrap()
        .args(["deacon", "idle-wait"])
        .env("GT_TOWN_ROOT", &root)
        .assert()
        .success()
        .stdout(predicate::str::contains("System active"));
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn returns_immediately_when_no_state() {
    let (_tmp, root) = town();

    Command::cargo_bin("gt")
        .unwrap()
        .args(["deacon", "idle-wait"])
        .env("GT_TOWN_ROOT", &root)
        .assert()
        .success()
        .stdout(predicate::str::contains("System active"));
}

#[test]
fn wake_signal_breaks_sleep_early() {
    let (_tmp, root) = town();
    fs::write(
        root.join("daemon/idle-state.json"),
        r#"{"idle": true, "backoff_interval_secs": 60}"#,
    )
    .unwrap();

    let gt_bin = assert_cmd::cargo::cargo_bin("gt");
    let start = Instant::now();
    let child = std::process::Command::new(&gt_bin)
        .args(["deacon", "idle-wait"])
        .env("GT_TOWN_ROOT", &root)
        .stdout(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    // Let it enter the sleep, then signal a wake.
    std::thread::sleep(Duration::from_secs(2));
    fs::write(root.join("daemon/idle-wake"), "2026-01-15T10:00:00Z").unwrap();

    let output = child.wait_with_output().unwrap();
    let elapsed = start.elapsed();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Wake signal detected"),
        "stdout: {stdout}"
    );
    // One poll tick after the signal, nowhere near the 60s backoff.
    assert!(elapsed < Duration::from_secs(15), "elapsed: {elapsed:?}");
}

#[test]
fn max_flag_caps_the_backoff() {
    let (_tmp, root) = town();
    fs::write(
        root.join("daemon/idle-state.json"),
        r#"{"idle": true, "backoff_interval_secs": 300}"#,
    )
    .unwrap();

    let start = Instant::now();
    Command::cargo_bin("gt")
        .unwrap()
        .args(["deacon", "idle-wait", "--max", "6s"])
        .env("GT_TOWN_ROOT", &root)
        .timeout(Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("sleeping 6s"));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "elapsed: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(20), "elapsed: {elapsed:?}");
}
