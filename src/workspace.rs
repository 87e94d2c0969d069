//! Town root discovery.
//!
//! A town is the workspace directory tree every queue artifact lives under:
//! `settings/town.json` marks the root, `.runtime/` holds queue and rate
//! limit state, `daemon/` holds idle state, and each rig is a subdirectory
//! with its own `.beads/` store.

use std::path::{Path, PathBuf};

use crate::error::ExitError;

/// Marker file that identifies a town root.
const TOWN_MARKER: &str = "settings/town.json";

/// Returns true if the given directory is a town root.
pub fn is_town_root(dir: &Path) -> bool {
    dir.join(TOWN_MARKER).is_file()
}

/// Find the town root starting from the current directory.
///
/// `GT_TOWN_ROOT` overrides discovery (set by the daemon for its spawned
/// subprocesses, and by tests). Otherwise walks up from the CWD looking for
/// the marker file.
pub fn find_from_cwd() -> Option<PathBuf> {
    if let Ok(root) = std::env::var("GT_TOWN_ROOT") {
        if !root.is_empty() {
            return Some(PathBuf::from(root));
        }
    }

    let mut dir = std::env::current_dir().ok()?;
    loop {
        if is_town_root(&dir) {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Find the town root, or return a descriptive error.
pub fn find_from_cwd_or_error() -> anyhow::Result<PathBuf> {
    find_from_cwd().ok_or_else(|| {
        ExitError::NoWorkspace(
            "no settings/town.json found in this directory or any parent".to_string(),
        )
        .into()
    })
}
