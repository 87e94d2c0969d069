use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Top-level settings/town.json config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TownSettings {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Work queue limits and daemon gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Gates daemon-triggered dispatch only; manual `gt queue run` always
    /// proceeds.
    #[serde(default)]
    pub enabled: bool,
    /// Global polecat ceiling. 0 means unlimited.
    #[serde(default = "default_max_polecats")]
    pub max_polecats: u32,
    /// Max beads dispatched per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Pause between spawns within a batch, in seconds.
    #[serde(default = "default_spawn_delay_secs")]
    pub spawn_delay_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_polecats: default_max_polecats(),
            batch_size: default_batch_size(),
            spawn_delay_secs: default_spawn_delay_secs(),
        }
    }
}

impl QueueConfig {
    pub fn spawn_delay(&self) -> Duration {
        Duration::from_secs(self.spawn_delay_secs)
    }
}

// Default value functions for serde
fn default_max_polecats() -> u32 { 6 }
fn default_batch_size() -> u32 { 3 }
fn default_spawn_delay_secs() -> u64 { 2 }

/// Path to the town settings file.
pub fn town_settings_path(town_root: &Path) -> PathBuf {
    town_root.join("settings").join("town.json")
}

impl TownSettings {
    /// Load settings, falling back to defaults when the file is missing or
    /// empty. A malformed file is a config error, not a silent default.
    pub fn load(town_root: &Path) -> anyhow::Result<Self> {
        let path = town_settings_path(town_root);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("reading {}", path.display()));
            }
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::parse(&contents)
    }

    /// Parse settings from a JSON string.
    pub fn parse(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid settings/town.json: {e}")).into())
    }
}

/// Registry of known rigs, stored at settings/rigs.json.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigRegistry {
    #[serde(default)]
    pub rigs: BTreeMap<String, RigEntry>,
}

/// Per-rig registry entry. Fields beyond the name are informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigEntry {
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Path to the rig registry file.
pub fn rigs_path(town_root: &Path) -> PathBuf {
    town_root.join("settings").join("rigs.json")
}

impl RigRegistry {
    /// Load the rig registry. Missing file means no rigs registered.
    pub fn load(town_root: &Path) -> anyhow::Result<Self> {
        let path = rigs_path(town_root);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("reading {}", path.display()));
            }
        };
        serde_json::from_str(&contents)
            .map_err(|e| ExitError::Config(format!("invalid settings/rigs.json: {e}")).into())
    }

    /// Returns true if the given name is a registered rig.
    pub fn is_rig_name(&self, name: &str) -> bool {
        self.rigs.contains_key(name)
    }

    /// Registered rig names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.rigs.keys().map(String::as_str).collect()
    }
}
