//! Enqueue: convert "run this bead on that rig, later" into an
//! actively-queued bead.
//!
//! The commit protocol is metadata-first, label-last. Queue metadata without
//! the gt:queued label is inert (dispatch only queries labeled beads), so
//! the label add is the atomic commit of the enqueue. The inverse order
//! would open a window where dispatch sees the label, parses no metadata,
//! and irreversibly quarantines the bead.

use std::path::Path;

use anyhow::Context;

use crate::beads::{self, LABEL_QUEUED};
use crate::config::RigRegistry;
use crate::convoy;
use crate::error::ExitError;
use crate::events;
use crate::idle;
use crate::queue::metadata::{strip_metadata, QueueMetadata};
use crate::subprocess::Tool;

/// Options for enqueueing a bead.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Formula to apply at dispatch time (e.g. "mol-polecat-work").
    pub formula: String,
    /// Natural-language args for the executor.
    pub args: String,
    /// Formula variables (key=value).
    pub vars: Vec<String>,
    /// Merge strategy: direct/mr/local.
    pub merge: String,
    /// Override base branch for the polecat worktree.
    pub base_branch: String,
    /// Skip auto-convoy creation.
    pub no_convoy: bool,
    /// Mark the auto-convoy as caller-managed lifecycle.
    pub owned: bool,
    /// Show what would be done without acting.
    pub dry_run: bool,
    /// Force enqueue even if the bead is pinned/hooked or cross-rig.
    pub force: bool,
    /// Skip the merge queue on completion.
    pub no_merge: bool,
    /// Claude Code account handle.
    pub account: String,
    /// Agent override (e.g. "gemini", "codex").
    pub agent: String,
    /// Hook the raw bead without a default formula.
    pub hook_raw_bead: bool,
}

/// Queue a bead for deferred dispatch. Writes queue metadata into the
/// description, adds the gt:queued label, and creates an auto-convoy. Does
/// NOT spawn a polecat or hook the bead.
pub fn enqueue_bead(
    town_root: &Path,
    bead_id: &str,
    rig_name: &str,
    opts: &EnqueueOptions,
) -> anyhow::Result<()> {
    beads::verify_bead_exists(town_root, bead_id)
        .map_err(|_| anyhow::anyhow!("bead '{bead_id}' not found"))?;

    let rigs = RigRegistry::load(town_root)?;
    if !rigs.is_rig_name(rig_name) {
        return Err(ExitError::UnknownRig(rig_name.to_string()).into());
    }

    // Cross-rig guard: polecats are worktree-scoped, so a bead from rig A
    // dispatched in rig B produces a broken polecat.
    if !opts.force {
        check_cross_rig(town_root, bead_id, rig_name)?;
    }

    let info = beads::get_bead_info(town_root, bead_id).context("checking bead status")?;

    // Idempotency: already actively queued (open + label) is a no-op.
    // Dispatched beads are hooked/closed, so they stay re-queueable.
    if beads::has_queued_label(&info.labels) && info.status == "open" {
        println!("○ Bead {bead_id} is already queued, no-op");
        return Ok(());
    }

    if (info.status == "pinned" || info.status == "hooked") && !opts.force {
        return Err(ExitError::BeadBusy {
            bead: bead_id.to_string(),
            status: info.status,
            assignee: info.assignee,
        }
        .into());
    }

    // Lightweight formula check, no side effects, so dry-run stays clean.
    if !opts.formula.is_empty() {
        verify_formula_exists(town_root, &opts.formula)?;
    }

    if opts.dry_run {
        println!("Would queue {bead_id} → {rig_name}");
        println!("  Would add label: {LABEL_QUEUED}");
        println!("  Would append queue metadata to description");
        if !opts.no_convoy {
            println!("  Would create auto-convoy");
        }
        return Ok(());
    }

    // Cook after the dry-run gate: cooking emits artifacts. A bad proto is
    // caught here instead of surfacing as an endless dispatch-requeue loop.
    if !opts.formula.is_empty() {
        let work_dir = beads::resolve_bead_dir(town_root, bead_id);
        cook_formula(&opts.formula, &work_dir)?;
    }

    let mut meta = QueueMetadata::new(rig_name);
    meta.formula = opts.formula.clone();
    meta.args = opts.args.clone();
    meta.vars = opts.vars.join("\n");
    meta.merge = opts.merge.clone();
    meta.base_branch = opts.base_branch.clone();
    meta.no_merge = opts.no_merge;
    meta.account = opts.account.clone();
    meta.agent = opts.agent.clone();
    meta.hook_raw_bead = opts.hook_raw_bead;
    meta.owned = opts.owned;
    // No-boot is intentionally not stored: dispatch always forces it, so a
    // stored value would be dead contract signaling.

    // Strip any prior block first so re-enqueue never stacks delimiters.
    let base_desc = strip_metadata(&info.description).to_string();
    let new_desc = join_description(&base_desc, &meta.format());

    let bead_dir = beads::resolve_bead_dir(town_root, bead_id);
    beads::update_description(&bead_dir, bead_id, &new_desc)
        .context("writing queue metadata")?;

    // The label is the activation signal for dispatch.
    if let Err(label_err) = beads::add_label(&bead_dir, bead_id, LABEL_QUEUED) {
        // Roll back the metadata so the bead carries no orphaned queue data.
        let _ = beads::update_description(&bead_dir, bead_id, &base_desc);
        return Err(label_err).context("adding queue label");
    }

    // Fresh work should pull the daemon out of idle backoff promptly.
    // Best effort: a missed wake only delays dispatch to the next heartbeat.
    let _ = idle::signal_wake(town_root);

    if !opts.no_convoy {
        match convoy::tracking_convoy(town_root, bead_id) {
            Some(existing) => {
                println!("○ Already tracked by convoy {existing}");
            }
            None => match convoy::create_auto_convoy(town_root, bead_id, &info.title, opts.owned)
            {
                Ok(convoy_id) => {
                    println!("→ Created convoy {convoy_id}");
                    // Re-persist metadata with the convoy id so dispatch can
                    // see it. Best effort: metadata without a convoy is
                    // still dispatchable.
                    meta.convoy = convoy_id;
                    let updated = join_description(&base_desc, &meta.format());
                    if let Err(e) = beads::update_description(&bead_dir, bead_id, &updated) {
                        println!("Warning: could not update metadata with convoy: {e:#}");
                    }
                }
                Err(e) => {
                    println!("Warning: could not create auto-convoy: {e:#}");
                }
            },
        }
    }

    let actor = events::detect_actor();
    events::log_feed(
        town_root,
        events::TYPE_QUEUE_ENQUEUE,
        &actor,
        events::enqueue_payload(bead_id, rig_name),
    );

    println!("✓ Queued {bead_id} → {rig_name}");
    Ok(())
}

/// Append a metadata block to a (possibly empty) base description.
fn join_description(base: &str, block: &str) -> String {
    if base.is_empty() {
        block.to_string()
    } else {
        format!("{base}\n{block}")
    }
}

/// Error if the bead belongs to a different rig than the enqueue target.
fn check_cross_rig(town_root: &Path, bead_id: &str, rig_name: &str) -> anyhow::Result<()> {
    let bead_dir = beads::resolve_bead_dir(town_root, bead_id);
    if bead_dir == town_root {
        // Town-store beads are not rig-scoped.
        return Ok(());
    }
    if let Some(owner) = bead_dir.file_name().and_then(|n| n.to_str()) {
        if owner != rig_name {
            return Err(ExitError::CrossRig {
                bead: bead_id.to_string(),
                owner: owner.to_string(),
                target: rig_name.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Side-effect-free formula existence check.
fn verify_formula_exists(town_root: &Path, formula: &str) -> anyhow::Result<()> {
    Tool::new("bd")
        .args(&["cook", formula, "--dry-run"])
        .current_dir(town_root)
        .run_ok()
        .map_err(|e| ExitError::FormulaInvalid {
            formula: formula.to_string(),
            detail: format!("{e:#}"),
        })?;
    Ok(())
}

/// Proto-validate the formula, emitting its artifacts in the work dir.
fn cook_formula(formula: &str, work_dir: &Path) -> anyhow::Result<()> {
    Tool::new("bd")
        .args(&["cook", formula])
        .current_dir(work_dir)
        .run_ok()
        .map_err(|e| ExitError::FormulaInvalid {
            formula: formula.to_string(),
            detail: format!("{e:#}"),
        })?;
    Ok(())
}

/// Enqueue several beads; per-item failures are reported and do not abort
/// the batch. Returns the number queued.
pub fn enqueue_batch(
    town_root: &Path,
    bead_ids: &[String],
    rig_name: &str,
    opts: &EnqueueOptions,
) -> u32 {
    let mut success = 0;
    for bead_id in bead_ids {
        match enqueue_bead(town_root, bead_id, rig_name, opts) {
            Ok(()) => success += 1,
            Err(e) => println!("  ✗ {bead_id}: {e:#}"),
        }
    }
    success
}
