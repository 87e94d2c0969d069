//! Wrapper around the bd issue-store CLI.
//!
//! bd is CWD-scoped: it operates on the `.beads/` store of the directory it
//! runs in. A town has a store at the root plus one per rig, so queries scan
//! every store and mutations are routed to the directory that owns the bead.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::subprocess::Tool;

/// Marks a bead as queued for dispatch. The label is the enqueue commit bit:
/// dispatch only sees beads that carry it.
pub const LABEL_QUEUED: &str = "gt:queued";

/// Audit label added when a queued bead is successfully dispatched.
pub const LABEL_DISPATCHED: &str = "gt:queue-dispatched";

/// Terminal label for beads that exhausted dispatch retries.
pub const LABEL_DISPATCH_FAILED: &str = "gt:dispatch-failed";

/// Parsed output of `bd show <id> --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct BeadInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// One element of `bd ready --json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyBead {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// One element of `bd dep list --json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct DepChild {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
}

/// Returns true if the label set contains gt:queued.
pub fn has_queued_label(labels: &[String]) -> bool {
    labels.iter().any(|l| l == LABEL_QUEUED)
}

/// Directories to run bd queries in: the town root plus every first-level
/// subdirectory with its own `.beads/` store (the rigs).
pub fn beads_search_dirs(town_root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if town_root.join(".beads").is_dir() {
        dirs.push(town_root.to_path_buf());
    }
    if let Ok(entries) = std::fs::read_dir(town_root) {
        let mut rigs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.join(".beads").is_dir())
            .collect();
        rigs.sort();
        dirs.extend(rigs);
    }
    if dirs.is_empty() {
        // No stores found; fall back to the root so callers still get a
        // concrete bd error instead of an empty scan.
        dirs.push(town_root.to_path_buf());
    }
    dirs
}

/// Directory whose bd store owns the given bead. Probes each search dir with
/// `bd show`; falls back to the town root when no store claims the bead.
pub fn resolve_bead_dir(town_root: &Path, bead_id: &str) -> PathBuf {
    for dir in beads_search_dirs(town_root) {
        let probe = Tool::new("bd")
            .args(&["show", bead_id, "--json"])
            .current_dir(&dir)
            .run();
        if matches!(probe, Ok(ref out) if out.success()) {
            return dir;
        }
    }
    town_root.to_path_buf()
}

/// Fetch bead details from the store that owns it.
pub fn get_bead_info(town_root: &Path, bead_id: &str) -> anyhow::Result<BeadInfo> {
    let dir = resolve_bead_dir(town_root, bead_id);
    let output = Tool::new("bd")
        .args(&["show", bead_id, "--json"])
        .current_dir(&dir)
        .run_ok()
        .with_context(|| format!("bd show {bead_id}"))?;
    output
        .parse_json()
        .with_context(|| format!("parsing bd show output for {bead_id}"))
}

/// Returns an error if the bead does not exist in any store.
pub fn verify_bead_exists(town_root: &Path, bead_id: &str) -> anyhow::Result<()> {
    get_bead_info(town_root, bead_id).map(|_| ())
}

/// Replace a bead's description.
pub fn update_description(dir: &Path, bead_id: &str, description: &str) -> anyhow::Result<()> {
    Tool::new("bd")
        .arg("update")
        .arg(bead_id)
        .arg(&format!("--description={description}"))
        .current_dir(dir)
        .run_ok()
        .with_context(|| format!("bd update {bead_id} --description"))?;
    Ok(())
}

/// Add a label to a bead.
pub fn add_label(dir: &Path, bead_id: &str, label: &str) -> anyhow::Result<()> {
    Tool::new("bd")
        .arg("update")
        .arg(bead_id)
        .arg(&format!("--add-label={label}"))
        .current_dir(dir)
        .run_ok()
        .with_context(|| format!("bd update {bead_id} --add-label={label}"))?;
    Ok(())
}

/// Atomically add one label and remove another in a single bd update.
pub fn swap_labels(dir: &Path, bead_id: &str, add: &str, remove: &str) -> anyhow::Result<()> {
    Tool::new("bd")
        .arg("update")
        .arg(bead_id)
        .arg(&format!("--add-label={add}"))
        .arg(&format!("--remove-label={remove}"))
        .current_dir(dir)
        .run_ok()
        .with_context(|| format!("bd update {bead_id} label swap"))?;
    Ok(())
}

/// Query ready (unblocked) beads carrying the given label in one store.
pub fn ready_with_label(dir: &Path, label: &str) -> anyhow::Result<Vec<ReadyBead>> {
    let output = Tool::new("bd")
        .args(&["ready", "--label", label, "--json", "--limit=0"])
        .current_dir(dir)
        .run_ok()
        .with_context(|| format!("bd ready in {}", dir.display()))?;
    output
        .parse_json()
        .with_context(|| format!("parsing bd ready output from {}", dir.display()))
}

/// List issues one dependency level below the given bead.
///
/// bd dep list exits non-zero both for "no deps" and for real errors; empty
/// stdout with empty stderr is the documented no-deps case.
pub fn dep_children(dir: &Path, bead_id: &str, dep_type: &str) -> anyhow::Result<Vec<DepChild>> {
    let output = Tool::new("bd")
        .args(&[
            "dep",
            "list",
            bead_id,
            "--direction=down",
            &format!("--type={dep_type}"),
            "--json",
        ])
        .current_dir(dir)
        .run()
        .with_context(|| format!("bd dep list {bead_id}"))?;

    if !output.success() {
        if output.stdout.trim().is_empty() && output.stderr.trim().is_empty() {
            return Ok(Vec::new());
        }
        anyhow::bail!(
            "bd dep list {bead_id} failed (exit {}): {}",
            output.exit_code,
            output.stderr.trim()
        );
    }

    output
        .parse_json()
        .with_context(|| format!("parsing dependency list for {bead_id}"))
}
