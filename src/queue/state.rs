use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Runtime operational state of the work queue, stored at
/// `<town>/.runtime/queue-state.json`.
///
/// Absence of the file means "not paused, never dispatched" — readers get
/// the zero value, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub paused_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub paused_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_dispatch_at: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub last_dispatch_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Path to the queue state file.
pub fn queue_state_path(town_root: &Path) -> PathBuf {
    town_root.join(".runtime").join("queue-state.json")
}

impl QueueState {
    /// Load the queue runtime state; a missing file yields the zero value.
    pub fn load(town_root: &Path) -> anyhow::Result<Self> {
        let path = queue_state_path(town_root);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("reading {}", path.display()));
            }
        };
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write the queue state atomically (temp file + rename) so a reader
    /// never observes a torn file when dispatch's RecordDispatch races a
    /// concurrent `gt queue pause`.
    pub fn save(&self, town_root: &Path) -> anyhow::Result<()> {
        let path = queue_state_path(town_root);
        let dir = town_root.join(".runtime");
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut data = serde_json::to_string_pretty(self).context("serializing queue state")?;
        data.push('\n');

        let tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        std::fs::write(tmp.path(), data).context("writing queue state temp file")?;
        tmp.persist(&path)
            .with_context(|| format!("persisting {}", path.display()))?;
        Ok(())
    }

    /// Mark the queue as paused by the given actor.
    pub fn set_paused(&mut self, by: &str) {
        self.paused = true;
        self.paused_by = by.to_string();
        self.paused_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    }

    /// Mark the queue as resumed.
    pub fn set_resumed(&mut self) {
        self.paused = false;
        self.paused_by.clear();
        self.paused_at.clear();
    }

    /// Record a completed dispatch batch.
    pub fn record_dispatch(&mut self, count: u32) {
        self.last_dispatch_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.last_dispatch_count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    #[test]
    fn load_missing_file_is_zero_value() {
        let tmp = tempfile::tempdir().unwrap();

        let state = QueueState::load(tmp.path()).unwrap();
        assert!(!state.paused);
        assert!(state.paused_by.is_empty());
        assert!(state.last_dispatch_at.is_empty());
        assert_eq!(state.last_dispatch_count, 0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();

        let original = QueueState {
            paused: true,
            paused_by: "test-user".to_string(),
            paused_at: "2026-01-15T10:00:00Z".to_string(),
            last_dispatch_at: "2026-01-15T09:30:00Z".to_string(),
            last_dispatch_count: 3,
        };
        original.save(tmp.path()).unwrap();

        let loaded = QueueState::load(tmp.path()).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn set_paused_stamps_rfc3339() {
        let mut state = QueueState::default();

        let before = Utc::now();
        state.set_paused("admin");
        let after = Utc::now();

        assert!(state.paused);
        assert_eq!(state.paused_by, "admin");

        let ts = DateTime::parse_from_rfc3339(&state.paused_at)
            .expect("paused_at is not valid RFC3339")
            .with_timezone(&Utc);
        assert!(ts >= before - Duration::seconds(1));
        assert!(ts <= after + Duration::seconds(1));
    }

    #[test]
    fn set_resumed_clears_pause_fields() {
        let mut state = QueueState {
            paused: true,
            paused_by: "admin".to_string(),
            paused_at: "2026-01-15T10:00:00Z".to_string(),
            ..Default::default()
        };

        state.set_resumed();

        assert!(!state.paused);
        assert!(state.paused_by.is_empty());
        assert!(state.paused_at.is_empty());
    }

    #[test]
    fn record_dispatch_stamps_count_and_time() {
        let mut state = QueueState::default();

        let before = Utc::now();
        state.record_dispatch(5);
        let after = Utc::now();

        assert_eq!(state.last_dispatch_count, 5);

        let ts = DateTime::parse_from_rfc3339(&state.last_dispatch_at)
            .expect("last_dispatch_at is not valid RFC3339")
            .with_timezone(&Utc);
        assert!(ts >= before - Duration::seconds(1));
        assert!(ts <= after + Duration::seconds(1));
    }

    #[test]
    fn save_creates_runtime_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime_dir = tmp.path().join(".runtime");
        assert!(!runtime_dir.exists());

        let state = QueueState {
            paused: true,
            paused_by: "test".to_string(),
            ..Default::default()
        };
        state.save(tmp.path()).unwrap();

        assert!(runtime_dir.is_dir());
        assert!(runtime_dir.join("queue-state.json").is_file());
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        QueueState::default().save(tmp.path()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join(".runtime"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name() != "queue-state.json")
            .collect();
        assert!(leftovers.is_empty(), "stray files: {leftovers:?}");
    }
}
