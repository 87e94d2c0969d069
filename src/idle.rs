//! Idle state tracking for the daemon and the deacon patrol.
//!
//! The daemon writes a snapshot of system activity each heartbeat; the
//! deacon reads it to decide whether to back off its patrol cycle. Any CLI
//! that is about to start work drops a wake signal file to break the idle
//! sleep early.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::convoy;
use crate::session;

const IDLE_STATE_FILE: &str = "idle-state.json";

/// Signal file written to wake the system from idle. The daemon consumes it
/// on the next heartbeat; the deacon polls for it mid-sleep.
const IDLE_WAKE_FILE: &str = "idle-wake";

/// Minimum deacon backoff while idle.
pub const MIN_BACKOFF: Duration = Duration::from_secs(30);

/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// The system's idle/active state, written by the daemon only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdleState {
    /// True when no polecats or convoys are active.
    pub idle: bool,

    /// When the system became idle. None while active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,

    /// Number of active polecat tmux sessions.
    #[serde(default)]
    pub polecat_count: u32,

    /// Number of open convoys.
    #[serde(default)]
    pub convoy_count: u32,

    /// True when the Dolt server was intentionally stopped due to idle.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dolt_stopped: bool,

    /// Recommended deacon sleep between patrol cycles, in seconds.
    /// Grows while idle, resets when work arrives.
    #[serde(default)]
    pub backoff_interval_secs: u64,

    /// When this state was last written.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IdleState {
    pub fn backoff_interval(&self) -> Duration {
        Duration::from_secs(self.backoff_interval_secs)
    }
}

/// Path to the idle state file.
pub fn idle_state_path(town_root: &Path) -> PathBuf {
    town_root.join("daemon").join(IDLE_STATE_FILE)
}

/// Path to the idle wake signal file.
pub fn idle_wake_path(town_root: &Path) -> PathBuf {
    town_root.join("daemon").join(IDLE_WAKE_FILE)
}

/// Write the idle state, stamping `updated_at`.
pub fn write_idle_state(town_root: &Path, state: &mut IdleState) -> anyhow::Result<()> {
    state.updated_at = Some(Utc::now());
    let path = idle_state_path(town_root);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let data = serde_json::to_string_pretty(state).context("serializing idle state")?;
    std::fs::write(&path, data).with_context(|| format!("writing {}", path.display()))
}

/// Read the idle state. Returns None when the file is missing or unreadable;
/// consumers treat that as "active".
pub fn read_idle_state(town_root: &Path) -> Option<IdleState> {
    let data = std::fs::read_to_string(idle_state_path(town_root)).ok()?;
    serde_json::from_str(&data).ok()
}

/// Quick check used by other subsystems before starting work.
pub fn is_system_idle(town_root: &Path) -> bool {
    read_idle_state(town_root).is_some_and(|s| s.idle)
}

/// True when Dolt was intentionally stopped due to idle.
pub fn is_dolt_idle_stopped(town_root: &Path) -> bool {
    read_idle_state(town_root).is_some_and(|s| s.dolt_stopped)
}

/// Write the wake signal file to tell the daemon to exit idle state.
/// Called by any CLI that is about to create work.
pub fn signal_wake(town_root: &Path) -> anyhow::Result<()> {
    let path = idle_wake_path(town_root);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    std::fs::write(&path, Utc::now().to_rfc3339())
        .with_context(|| format!("writing {}", path.display()))
}

/// Check for and remove the wake signal file. Returns true if a signal was
/// present. Removal is best effort; a lost race on the remove is fine since
/// the signal has been observed.
pub fn consume_wake_signal(town_root: &Path) -> bool {
    let path = idle_wake_path(town_root);
    if !path.exists() {
        return false;
    }
    let _ = std::fs::remove_file(&path);
    true
}

/// Next backoff duration for the deacon patrol: doubles from 30s up to the
/// 5 minute cap, monotonic until work arrives.
pub fn next_backoff_interval(current: Duration) -> Duration {
    if current < MIN_BACKOFF {
        return MIN_BACKOFF;
    }
    (current * 2).min(MAX_BACKOFF)
}

/// One daemon heartbeat's worth of idle accounting: census the system,
/// advance or reset the backoff, and persist the result.
///
/// A pending wake signal forces the active path and resets backoff even if
/// the census still reads zero (the work it announces may not have sessions
/// yet).
pub fn update_idle_state(town_root: &Path) -> anyhow::Result<IdleState> {
    let woken = consume_wake_signal(town_root);
    let polecat_count = session::count_active_polecats();
    let convoy_count = convoy::count_open_convoys(town_root);

    let prev = read_idle_state(town_root).unwrap_or_default();
    let mut state = IdleState {
        polecat_count,
        convoy_count,
        dolt_stopped: prev.dolt_stopped,
        ..Default::default()
    };

    if woken || polecat_count > 0 || convoy_count > 0 {
        state.idle = false;
        state.since = None;
        state.backoff_interval_secs = 0;
        state.dolt_stopped = false;
    } else {
        state.idle = true;
        state.since = prev.since.or_else(|| Some(Utc::now()));
        state.backoff_interval_secs =
            next_backoff_interval(prev.backoff_interval()).as_secs();
    }

    write_idle_state(town_root, &mut state)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_idle_state() {
        let tmp = tempfile::tempdir().unwrap();

        let mut state = IdleState {
            idle: true,
            since: Some(Utc::now() - chrono::Duration::minutes(5)),
            polecat_count: 0,
            convoy_count: 0,
            dolt_stopped: true,
            backoff_interval_secs: 120,
            updated_at: None,
        };
        write_idle_state(tmp.path(), &mut state).unwrap();

        let got = read_idle_state(tmp.path()).expect("read returned None");
        assert!(got.idle);
        assert!(got.dolt_stopped);
        assert_eq!(got.backoff_interval(), Duration::from_secs(120));
        assert!(got.updated_at.is_some());
    }

    #[test]
    fn read_missing_state_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_idle_state(tmp.path()).is_none());
    }

    #[test]
    fn system_idle_check() {
        let tmp = tempfile::tempdir().unwrap();

        // No state file → not idle.
        assert!(!is_system_idle(tmp.path()));

        let mut idle = IdleState {
            idle: true,
            ..Default::default()
        };
        write_idle_state(tmp.path(), &mut idle).unwrap();
        assert!(is_system_idle(tmp.path()));

        let mut active = IdleState {
            idle: false,
            polecat_count: 1,
            ..Default::default()
        };
        write_idle_state(tmp.path(), &mut active).unwrap();
        assert!(!is_system_idle(tmp.path()));
    }

    #[test]
    fn dolt_idle_stopped_check() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_dolt_idle_stopped(tmp.path()));

        let mut state = IdleState {
            idle: true,
            dolt_stopped: true,
            ..Default::default()
        };
        write_idle_state(tmp.path(), &mut state).unwrap();
        assert!(is_dolt_idle_stopped(tmp.path()));
    }

    #[test]
    fn signal_wake_and_consume() {
        let tmp = tempfile::tempdir().unwrap();

        // No signal initially.
        assert!(!consume_wake_signal(tmp.path()));

        signal_wake(tmp.path()).unwrap();
        assert!(consume_wake_signal(tmp.path()));

        // Consumed — second consume returns false.
        assert!(!consume_wake_signal(tmp.path()));
    }

    #[test]
    fn backoff_schedule() {
        let cases = [
            (0u64, 30u64),
            (10, 30),
            (30, 60),
            (60, 120),
            (120, 240),
            (240, 300), // capped at 5min
            (300, 300), // stays at cap
            (600, 300),
        ];
        for (current, want) in cases {
            let got = next_backoff_interval(Duration::from_secs(current));
            assert_eq!(
                got,
                Duration::from_secs(want),
                "next_backoff_interval({current}s)"
            );
        }
    }
}
