//! Interface to the sling executor.
//!
//! Sling is the black-box subsystem that hooks a bead and spawns a polecat
//! worker session for it. The queue reconstructs a full parameter record
//! from enqueue-time metadata and hands it over; everything past the spawn
//! (worktrees, tmux, boot) is sling's problem.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::subprocess::Tool;

/// How long to wait for sling before giving up on the spawn.
const SLING_TIMEOUT: Duration = Duration::from_secs(120);

/// Explicit parameter record for one executor invocation. Replaces the
/// flag-singleton plumbing the CLI layer would otherwise need: everything
/// the spawn depends on is visible in the record.
#[derive(Debug, Clone, Default)]
pub struct SlingParams {
    pub bead_id: String,
    pub rig_name: String,
    pub formula_name: String,
    pub args: String,
    pub vars: Vec<String>,
    pub merge: String,
    pub base_branch: String,
    pub no_merge: bool,
    pub account: String,
    pub agent: String,
    pub hook_raw_bead: bool,
    /// Skip auto-convoy creation (queue dispatch: already created at enqueue).
    pub no_convoy: bool,
    /// Skip waking rig agents (queue dispatch: avoids lock contention; a
    /// post-batch pass compensates).
    pub no_boot: bool,
    /// Fail the spawn when the formula fails to apply instead of proceeding
    /// bare. The queue path relies on this to roll back and stay queued.
    pub formula_fail_fatal: bool,
    /// Steal beads that are already hooked. Queue dispatch never sets this.
    pub force: bool,
    /// Identifies the invoking subsystem in sling's own logs.
    pub caller_context: String,
    pub town_root: PathBuf,
    pub beads_dir: PathBuf,
}

/// Spawn info reported by a successful sling run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnInfo {
    #[serde(default)]
    pub polecat_name: String,
}

/// Result of one executor invocation.
#[derive(Debug, Clone, Default)]
pub struct SlingResult {
    pub spawn_info: Option<SpawnInfo>,
}

/// Invoke the executor for one bead. Blocks until the worker is spawned or
/// sling reports failure.
pub fn execute_sling(params: &SlingParams) -> anyhow::Result<SlingResult> {
    let mut tool = Tool::new("sling")
        .arg(&params.bead_id)
        .arg(&params.rig_name)
        .timeout(SLING_TIMEOUT)
        .current_dir(&params.town_root);

    if !params.formula_name.is_empty() {
        tool = tool.arg("--formula").arg(&params.formula_name);
    }
    if !params.args.is_empty() {
        tool = tool.arg("--args").arg(&params.args);
    }
    for var in &params.vars {
        tool = tool.arg("--var").arg(var);
    }
    if !params.merge.is_empty() {
        tool = tool.arg("--merge").arg(&params.merge);
    }
    if !params.base_branch.is_empty() {
        tool = tool.arg("--base-branch").arg(&params.base_branch);
    }
    if params.no_merge {
        tool = tool.arg("--no-merge");
    }
    if !params.account.is_empty() {
        tool = tool.arg("--account").arg(&params.account);
    }
    if !params.agent.is_empty() {
        tool = tool.arg("--agent").arg(&params.agent);
    }
    if params.hook_raw_bead {
        tool = tool.arg("--hook-raw-bead");
    }
    if params.no_convoy {
        tool = tool.arg("--no-convoy");
    }
    if params.no_boot {
        tool = tool.arg("--no-boot");
    }
    if params.formula_fail_fatal {
        tool = tool.arg("--formula-fail-fatal");
    }
    if params.force {
        tool = tool.arg("--force");
    }
    if !params.caller_context.is_empty() {
        tool = tool.arg("--caller-context").arg(&params.caller_context);
    }
    if !params.beads_dir.as_os_str().is_empty() {
        tool = tool
            .arg("--beads-dir")
            .arg(&params.beads_dir.to_string_lossy());
    }

    let output = tool.run_ok().context("sling")?;

    // Spawn info is the last JSON line on stdout; sling may print progress
    // above it. Missing or unparseable info is not a failure.
    let spawn_info = output
        .stdout
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .and_then(|l| serde_json::from_str::<SpawnInfo>(l).ok());

    Ok(SlingResult { spawn_info })
}
