use clap::{Args, Subcommand};

use crate::beads;
use crate::config::RigRegistry;
use crate::error::ExitError;
use crate::events;
use crate::queue::{dispatch_queued_work, enqueue, DispatchOverrides, EnqueueOptions};
use crate::workspace;

/// Default formula applied to queued work unless the raw bead is hooked.
pub const DEFAULT_WORK_FORMULA: &str = "mol-polecat-work";

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Run one dispatch cycle (also triggered by the daemon heartbeat)
    Run(RunArgs),
    /// Pause queue dispatch
    Pause,
    /// Resume queue dispatch
    Resume,
    /// Queue all open children of an epic for deferred dispatch
    Epic(EpicArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Max beads to dispatch this cycle (overrides town settings)
    #[arg(long)]
    pub batch: Option<u32>,
    /// Polecat ceiling for this cycle (overrides town settings)
    #[arg(long)]
    pub max_polecats: Option<u32>,
    /// Show what would be dispatched without acting
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct EpicArgs {
    /// Epic bead id
    pub epic_id: String,
    /// Target rig for all children
    pub rig: String,
    /// Show what would be queued without acting
    #[arg(long)]
    pub dry_run: bool,
    /// Force enqueue even if a bead is hooked/assigned
    #[arg(long)]
    pub force: bool,
}

impl QueueCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::Run(args) => args.execute(),
            Self::Pause => execute_pause(),
            Self::Resume => execute_resume(),
            Self::Epic(args) => args.execute(),
        }
    }
}

impl RunArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = workspace::find_from_cwd_or_error()?;
        let actor = events::detect_actor();
        let overrides = DispatchOverrides {
            batch_size: self.batch,
            max_polecats: self.max_polecats,
            dry_run: self.dry_run,
        };
        dispatch_queued_work(&town_root, &actor, &overrides)?;
        Ok(())
    }
}

fn execute_pause() -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd_or_error()?;
    let mut state = crate::queue::QueueState::load(&town_root)?;
    if state.paused {
        println!("○ Queue is already paused (by {})", state.paused_by);
        return Ok(());
    }
    state.set_paused(&events::detect_actor());
    state.save(&town_root)?;
    println!("⏸ Queue paused");
    Ok(())
}

fn execute_resume() -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd_or_error()?;
    let mut state = crate::queue::QueueState::load(&town_root)?;
    if !state.paused {
        println!("○ Queue is not paused");
        return Ok(());
    }
    state.set_resumed();
    state.save(&town_root)?;
    println!("▶ Queue resumed");
    Ok(())
}

/// A child issue of an epic, with the fields queueability depends on.
#[derive(Debug)]
struct EpicChild {
    id: String,
    title: String,
    status: String,
    assignee: String,
    labels: Vec<String>,
}

impl EpicArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = workspace::find_from_cwd_or_error()?;

        let rigs = RigRegistry::load(&town_root)?;
        if !rigs.is_rig_name(&self.rig) {
            return Err(ExitError::UnknownRig(self.rig.clone()).into());
        }

        beads::verify_bead_exists(&town_root, &self.epic_id)
            .map_err(|_| anyhow::anyhow!("epic '{}' not found", self.epic_id))?;

        let children = get_epic_children(&town_root, &self.epic_id)?;
        if children.is_empty() {
            println!("Epic {} has no child issues.", self.epic_id);
            return Ok(());
        }

        // ALL open children qualify, including blocked ones: blocked beads
        // wait in the queue and dispatch once bd ready unblocks them.
        let mut candidates: Vec<&EpicChild> = Vec::new();
        let mut skipped_closed = 0;
        let mut skipped_assigned = 0;
        let mut skipped_queued = 0;

        for child in &children {
            if child.status == "closed" || child.status == "tombstone" {
                skipped_closed += 1;
                continue;
            }
            if !child.assignee.is_empty() && !self.force {
                skipped_assigned += 1;
                continue;
            }
            if beads::has_queued_label(&child.labels) {
                skipped_queued += 1;
                continue;
            }
            candidates.push(child);
        }

        let skip_summary = || {
            if skipped_closed > 0 || skipped_assigned > 0 || skipped_queued > 0 {
                Some(format!(
                    "{skipped_closed} closed, {skipped_assigned} assigned, {skipped_queued} already queued"
                ))
            } else {
                None
            }
        };

        if candidates.is_empty() {
            match skip_summary() {
                Some(s) => println!("No children to queue from epic {} ({s})", self.epic_id),
                None => println!("No children to queue from epic {}", self.epic_id),
            }
            return Ok(());
        }

        if self.dry_run {
            println!(
                "📋 Would queue {} child(ren) from epic {} → {}:",
                candidates.len(),
                self.epic_id,
                self.rig
            );
            for c in &candidates {
                println!("  Would queue: {} ({})", c.id, c.title);
            }
            if let Some(s) = skip_summary() {
                println!("\nSkipped: {s}");
            }
            return Ok(());
        }

        println!(
            "📋 Queuing {} child(ren) from epic {} → {}...",
            candidates.len(),
            self.epic_id,
            self.rig
        );

        let opts = EnqueueOptions {
            formula: DEFAULT_WORK_FORMULA.to_string(),
            force: self.force,
            ..Default::default()
        };
        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let success = enqueue::enqueue_batch(&town_root, &ids, &self.rig, &opts);

        println!(
            "\n📊 Queued {success}/{} child(ren) from epic {}",
            candidates.len(),
            self.epic_id
        );
        if let Some(s) = skip_summary() {
            println!("  Skipped: {s}");
        }
        Ok(())
    }
}

/// Children of an epic via dependency lookup, enriched with labels and
/// assignee. Children whose detail lookup fails (cross-rig, deleted) keep
/// the dep-provided fields.
fn get_epic_children(
    town_root: &std::path::Path,
    epic_id: &str,
) -> anyhow::Result<Vec<EpicChild>> {
    let dir = beads::resolve_bead_dir(town_root, epic_id);
    let deps = beads::dep_children(&dir, epic_id, "depends_on")
        .map_err(|e| e.context(format!("listing children of {epic_id}")))?;

    let mut children = Vec::with_capacity(deps.len());
    for dep in deps {
        match beads::get_bead_info(town_root, &dep.id) {
            Ok(info) => children.push(EpicChild {
                id: info.id,
                title: info.title,
                status: info.status,
                assignee: info.assignee,
                labels: info.labels,
            }),
            Err(_) => children.push(EpicChild {
                id: dep.id,
                title: dep.title,
                status: dep.status,
                assignee: String::new(),
                labels: Vec::new(),
            }),
        }
    }
    Ok(children)
}
