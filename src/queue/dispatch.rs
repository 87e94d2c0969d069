//! Dispatch: convert queued beads into spawned polecats without exceeding
//! the global concurrency ceiling.
//!
//! Called by both `gt queue run` and the daemon heartbeat, so the whole loop
//! runs under an advisory file lock: two dispatchers racing the same
//! `bd ready` snapshot would double-spawn the same bead.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;

use crate::beads::{self, ReadyBead, LABEL_DISPATCHED, LABEL_DISPATCH_FAILED, LABEL_QUEUED};
use crate::config::TownSettings;
use crate::error::ExitError;
use crate::events;
use crate::queue::metadata::{split_vars, strip_metadata, QueueMetadata};
use crate::queue::state::QueueState;
use crate::session;
use crate::sling::{self, SlingParams};

/// Consecutive dispatch failures before a bead is marked gt:dispatch-failed
/// and removed from the queue. Prevents permanently-failing beads from
/// looping forever.
pub const MAX_DISPATCH_FAILURES: u32 = 3;

/// Caller-supplied overrides for one dispatch cycle.
#[derive(Debug, Clone, Default)]
pub struct DispatchOverrides {
    pub batch_size: Option<u32>,
    pub max_polecats: Option<u32>,
    pub dry_run: bool,
}

/// A queued bead ready for dispatch.
#[derive(Debug, Clone)]
struct ReadyQueuedBead {
    id: String,
    target_rig: String,
    description: String,
}

/// Path to the dispatch lock file.
pub fn dispatch_lock_path(town_root: &Path) -> PathBuf {
    town_root.join(".runtime").join("queue-dispatch.lock")
}

/// One dispatch cycle: check capacity, query ready beads, spawn up to the
/// batch limit. Returns the number of beads dispatched.
pub fn dispatch_queued_work(
    town_root: &Path,
    actor: &str,
    overrides: &DispatchOverrides,
) -> anyhow::Result<u32> {
    let runtime_dir = town_root.join(".runtime");
    std::fs::create_dir_all(&runtime_dir)
        .with_context(|| format!("creating {}", runtime_dir.display()))?;

    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dispatch_lock_path(town_root))
        .context("opening dispatch lock")?;
    if lock_file.try_lock_exclusive().is_err() {
        // Another dispatch is already running — skip silently.
        return Ok(0);
    }
    // Lock is held until lock_file drops at end of function.

    let state = QueueState::load(town_root).context("loading queue state")?;
    if state.paused {
        if !overrides.dry_run {
            println!("⏸ Queue is paused (by {}), skipping dispatch", state.paused_by);
        }
        return Ok(0);
    }

    let settings = TownSettings::load(town_root).context("loading town settings")?;
    let queue_cfg = &settings.queue;

    if !queue_cfg.enabled && !overrides.dry_run {
        // queue.enabled gates daemon auto-dispatch only. Manual `gt queue
        // run` always works so operators can dispatch without the loop.
        if is_daemon_dispatch() {
            return Ok(0);
        }
        println!("○ Queue auto-dispatch is not enabled (manual dispatch proceeding)");
        println!("  Enable daemon dispatch with: gt config set queue.enabled true");
    }

    let max_polecats = overrides.max_polecats.unwrap_or(queue_cfg.max_polecats);
    let batch_size = overrides.batch_size.unwrap_or(queue_cfg.batch_size);
    let spawn_delay = queue_cfg.spawn_delay();

    let active = session::count_active_polecats();

    // Available capacity; 0 means unlimited.
    let mut capacity = 0;
    if max_polecats > 0 {
        if active >= max_polecats {
            if overrides.dry_run {
                println!("No capacity: {active}/{max_polecats} polecats active");
            }
            return Ok(0);
        }
        capacity = max_polecats - active;
    }

    let ready = get_ready_queued_beads(town_root).context("querying ready beads")?;
    if ready.is_empty() {
        if overrides.dry_run {
            println!("No ready beads in queue");
        }
        return Ok(0);
    }

    let to_dispatch = compute_dispatch_count(capacity, batch_size, ready.len() as u32) as usize;
    let cap_str = capacity_display(max_polecats, capacity);

    if overrides.dry_run {
        println!(
            "📋 Would dispatch {to_dispatch} bead(s) (capacity: {cap_str}, batch: {batch_size}, ready: {})",
            ready.len()
        );
        for b in &ready[..to_dispatch] {
            println!("  Would dispatch: {} → {}", b.id, b.target_rig);
        }
        return Ok(0);
    }

    println!(
        "▶ Dispatching {to_dispatch} bead(s) (capacity: {cap_str}, ready: {})",
        ready.len()
    );

    let mut dispatched = 0;
    let mut successful_rigs: Vec<String> = Vec::new();
    for (i, b) in ready[..to_dispatch].iter().enumerate() {
        println!("\n[{}/{}] Dispatching {} → {}...", i + 1, to_dispatch, b.id, b.target_rig);

        if let Err(e) = dispatch_single_bead(b, town_root, actor) {
            println!("  ✗ Failed: {e:#}");
            continue;
        }
        dispatched += 1;
        if !b.target_rig.is_empty() && !successful_rigs.contains(&b.target_rig) {
            successful_rigs.push(b.target_rig.clone());
        }

        // Inter-spawn delay to avoid store lock contention.
        if i < to_dispatch - 1 && !spawn_delay.is_zero() {
            std::thread::sleep(spawn_delay);
        }
    }

    // Dispatch runs with boot suppressed to avoid lock contention, but the
    // new polecats need their rig's witness awake to monitor them.
    for rig in &successful_rigs {
        session::wake_rig_agents(rig);
    }

    // Fresh read before stamping: a `gt queue pause` may have landed while
    // the batch ran, and that pause must survive the save.
    if dispatched > 0 {
        match QueueState::load(town_root) {
            Ok(mut fresh) => {
                fresh.record_dispatch(dispatched);
                if let Err(e) = fresh.save(town_root) {
                    println!("Warning: could not save queue state: {e:#}");
                }
            }
            Err(e) => println!("Warning: could not reload queue state: {e:#}"),
        }
    }

    println!("\n✓ Dispatched {dispatched}/{to_dispatch} bead(s)");
    Ok(dispatched)
}

/// True when dispatch was triggered by the daemon heartbeat, which sets
/// GT_DAEMON=1 in the subprocess environment.
fn is_daemon_dispatch() -> bool {
    std::env::var("GT_DAEMON").is_ok_and(|v| v == "1")
}

/// Query beads that are both queued and unblocked, across every bead store
/// (bd ready is CWD-scoped). Per-directory failures are tolerated; if every
/// directory fails the store is unreachable and that is an error, distinct
/// from a legitimately empty queue.
fn get_ready_queued_beads(town_root: &Path) -> anyhow::Result<Vec<ReadyQueuedBead>> {
    let dirs = beads::beads_search_dirs(town_root);
    let mut result: Vec<ReadyQueuedBead> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut fail_count = 0;
    let mut last_err: Option<anyhow::Error> = None;

    for dir in &dirs {
        let found = match beads::ready_with_label(dir, LABEL_QUEUED) {
            Ok(f) => f,
            Err(e) => {
                fail_count += 1;
                println!("Warning: bd ready failed in {}: {e:#}", dir.display());
                last_err = Some(e);
                continue;
            }
        };
        for raw in found {
            if seen.iter().any(|id| *id == raw.id) {
                continue;
            }
            seen.push(raw.id.clone());
            if let Some(b) = to_ready_queued(raw) {
                result.push(b);
            }
        }
    }

    if fail_count == dirs.len() {
        if let Some(last) = last_err {
            return Err(ExitError::StoreUnreachable {
                failed_dirs: fail_count,
                detail: format!("{last:#}"),
            }
            .into());
        }
    }
    Ok(result)
}

/// Convert a raw ready bead, applying the circuit breaker: beads at or past
/// the failure cap are dropped from the ready set.
fn to_ready_queued(raw: ReadyBead) -> Option<ReadyQueuedBead> {
    let mut target_rig = String::new();
    if let Some(meta) = QueueMetadata::parse(&raw.description) {
        if meta.dispatch_failures >= MAX_DISPATCH_FAILURES {
            return None;
        }
        target_rig = meta.target_rig;
    }
    Some(ReadyQueuedBead {
        id: raw.id,
        target_rig,
        description: raw.description,
    })
}

/// Dispatch one queued bead via the executor, reconstructing the full
/// parameter record from enqueue-time metadata.
///
/// On success gt:queued is swapped for gt:queue-dispatched so a reopened
/// bead is never mistaken for an actively-queued one.
fn dispatch_single_bead(b: &ReadyQueuedBead, town_root: &Path, actor: &str) -> anyhow::Result<()> {
    let meta = QueueMetadata::parse(&b.description);

    // Beads without metadata (e.g. manually labeled gt:queued) can never
    // dispatch. Quarantine immediately rather than spending circuit breaker
    // retries on a deterministic failure.
    let meta = match meta {
        Some(m) if !m.target_rig.is_empty() => m,
        _ => {
            let bead_dir = beads::resolve_bead_dir(town_root, &b.id);
            // Remove gt:queued too: with no metadata there is no failure
            // counter for bd ready filtering to key off.
            let _ = beads::swap_labels(&bead_dir, &b.id, LABEL_DISPATCH_FAILED, LABEL_QUEUED);
            return Err(ExitError::DispatchQuarantined {
                bead: b.id.clone(),
                reason: "missing queue metadata or target_rig".to_string(),
            }
            .into());
        }
    };

    let rig_name = if b.target_rig.is_empty() {
        meta.target_rig.clone()
    } else {
        b.target_rig.clone()
    };

    // Force is never set: if the bead got hooked between bd ready and now
    // (a manual sling raced us), the executor reports "already hooked" and
    // we skip it rather than steal. The next cycle won't see a hooked bead.
    let params = SlingParams {
        bead_id: b.id.clone(),
        rig_name: rig_name.clone(),
        formula_name: meta.formula.clone(),
        args: meta.args.clone(),
        vars: split_vars(&meta.vars),
        merge: meta.merge.clone(),
        base_branch: meta.base_branch.clone(),
        no_merge: meta.no_merge,
        account: meta.account.clone(),
        agent: meta.agent.clone(),
        hook_raw_bead: meta.hook_raw_bead,
        no_convoy: true,          // convoy already created at enqueue
        no_boot: true,            // avoid lock contention in the daemon
        formula_fail_fatal: true, // queue path rolls back and stays queued
        force: false,
        caller_context: "queue-dispatch".to_string(),
        town_root: town_root.to_path_buf(),
        beads_dir: town_root.join(".beads"),
    };

    let result = match sling::execute_sling(&params) {
        Ok(r) => r,
        Err(e) => {
            events::log_feed(
                town_root,
                events::TYPE_QUEUE_DISPATCH_FAILED,
                actor,
                events::dispatch_failed_payload(&b.id, &rig_name, &format!("{e:#}")),
            );
            record_dispatch_failure(b, town_root, &e);
            return Err(e).context("sling failed");
        }
    };

    // Post-dispatch cleanup, best effort throughout: the spawn has already
    // happened, so cleanup failure is a warning, not a dispatch failure.
    let bead_dir = beads::resolve_bead_dir(town_root, &b.id);
    let clean_desc = strip_metadata(&b.description);
    if clean_desc != b.description {
        let _ = beads::update_description(&bead_dir, &b.id, clean_desc);
    }
    let _ = beads::swap_labels(&bead_dir, &b.id, LABEL_DISPATCHED, LABEL_QUEUED);

    let polecat_name = result
        .spawn_info
        .map(|s| s.polecat_name)
        .unwrap_or_default();
    events::log_feed(
        town_root,
        events::TYPE_QUEUE_DISPATCH,
        actor,
        events::dispatch_payload(&b.id, &rig_name, &polecat_name),
    );

    Ok(())
}

/// Increment the failure counter in the bead's queue metadata; at the cap,
/// quarantine via label swap. Best effort: the bead already failed, so a
/// metadata update failure only loses a retry count.
fn record_dispatch_failure(b: &ReadyQueuedBead, town_root: &Path, dispatch_err: &anyhow::Error) {
    let mut meta = QueueMetadata::parse(&b.description).unwrap_or_default();
    meta.dispatch_failures += 1;
    meta.last_failure = format!("{dispatch_err:#}");

    let base_desc = strip_metadata(&b.description);
    let new_desc = if base_desc.is_empty() {
        meta.format()
    } else {
        format!("{base_desc}\n{}", meta.format())
    };

    let bead_dir = beads::resolve_bead_dir(town_root, &b.id);
    let _ = beads::update_description(&bead_dir, &b.id, &new_desc);

    if meta.dispatch_failures >= MAX_DISPATCH_FAILURES {
        // Remove gt:queued as well, so the bead doesn't linger invisibly
        // (filtered from the ready set but still labeled).
        let _ = beads::swap_labels(&bead_dir, &b.id, LABEL_DISPATCH_FAILED, LABEL_QUEUED);
        println!(
            "  ⚠ Bead {} failed {} times, marked {LABEL_DISPATCH_FAILED}",
            b.id, meta.dispatch_failures
        );
    }
}

/// How many beads to dispatch given available capacity (0 = unlimited), the
/// per-cycle batch limit, and the ready-set size.
pub fn compute_dispatch_count(capacity: u32, batch_size: u32, ready_count: u32) -> u32 {
    let mut to_dispatch = batch_size;
    if capacity > 0 && capacity < to_dispatch {
        to_dispatch = capacity;
    }
    to_dispatch.min(ready_count)
}

/// Capacity string for display: "unlimited" or "N free of M".
fn capacity_display(max_polecats: u32, capacity: u32) -> String {
    if max_polecats > 0 {
        format!("{capacity} free of {max_polecats}")
    } else {
        "unlimited".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_count_table() {
        // (capacity 0 = unlimited, batch, ready) → want
        let cases = [
            (0u32, 3u32, 10u32, 3u32), // unlimited capacity, batch constrains
            (0, 5, 2, 2),              // unlimited capacity, ready constrains
            (4, 10, 20, 4),            // capacity constrains
            (10, 3, 20, 3),            // batch constrains
            (10, 5, 2, 2),             // ready constrains
            (3, 3, 3, 3),              // all equal
            (10, 5, 0, 0),             // zero ready
            (1, 5, 10, 1),             // capacity 1
            (0, 3, 1, 1),              // single bead
        ];
        for (capacity, batch, ready, want) in cases {
            assert_eq!(
                compute_dispatch_count(capacity, batch, ready),
                want,
                "compute_dispatch_count({capacity}, {batch}, {ready})"
            );
        }
    }

    #[test]
    fn circuit_breaker_filters_exhausted_beads() {
        let cases = [
            (0u32, false),
            (MAX_DISPATCH_FAILURES - 1, false),
            (MAX_DISPATCH_FAILURES, true),
            (MAX_DISPATCH_FAILURES + 5, true),
        ];
        for (failures, skipped) in cases {
            let meta = QueueMetadata {
                target_rig: "test-rig".to_string(),
                enqueued_at: "2026-01-15T10:00:00Z".to_string(),
                dispatch_failures: failures,
                last_failure: if failures > 0 {
                    "test error".to_string()
                } else {
                    String::new()
                },
                ..Default::default()
            };
            let raw = ReadyBead {
                id: "gt-abc".to_string(),
                title: String::new(),
                description: meta.format(),
                labels: vec![LABEL_QUEUED.to_string()],
            };
            assert_eq!(
                to_ready_queued(raw).is_none(),
                skipped,
                "failures={failures}"
            );
        }
    }

    #[test]
    fn ready_without_metadata_is_kept_for_quarantine() {
        // No metadata means no circuit breaker to check — the bead stays in
        // the ready set so dispatch_single_bead can quarantine it.
        let raw = ReadyBead {
            id: "gt-bare".to_string(),
            title: String::new(),
            description: "manually labeled, no metadata".to_string(),
            labels: vec![LABEL_QUEUED.to_string()],
        };
        let b = to_ready_queued(raw).unwrap();
        assert!(b.target_rig.is_empty());
    }

    #[test]
    fn capacity_display_format() {
        assert_eq!(capacity_display(0, 0), "unlimited");
        assert_eq!(capacity_display(10, 7), "7 free of 10");
        assert_eq!(capacity_display(5, 1), "1 free of 5");
    }
}
