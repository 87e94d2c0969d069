use clap::{Args, Subcommand};

use crate::beads;
use crate::commands::queue::DEFAULT_WORK_FORMULA;
use crate::config::RigRegistry;
use crate::convoy;
use crate::error::ExitError;
use crate::queue::{enqueue, EnqueueOptions};
use crate::workspace;

#[derive(Debug, Subcommand)]
pub enum ConvoyCommand {
    /// Queue all open tracked issues for deferred dispatch
    Queue(ConvoyQueueArgs),
}

#[derive(Debug, Args)]
pub struct ConvoyQueueArgs {
    /// Convoy id
    pub convoy_id: String,
    /// Target rig for all tracked issues
    pub rig: String,
    /// Show what would be queued without acting
    #[arg(long)]
    pub dry_run: bool,
    /// Force enqueue even if a bead is hooked/assigned
    #[arg(long)]
    pub force: bool,
}

impl ConvoyCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::Queue(args) => args.execute(),
        }
    }
}

impl ConvoyQueueArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = workspace::find_from_cwd_or_error()?;

        let rigs = RigRegistry::load(&town_root)?;
        if !rigs.is_rig_name(&self.rig) {
            return Err(ExitError::UnknownRig(self.rig.clone()).into());
        }

        beads::verify_bead_exists(&town_root, &self.convoy_id)
            .map_err(|_| anyhow::anyhow!("convoy '{}' not found", self.convoy_id))?;

        let tracked = convoy::tracked_issues(&town_root, &self.convoy_id)?;
        if tracked.is_empty() {
            println!("Convoy {} has no tracked issues.", self.convoy_id);
            return Ok(());
        }

        // Blocked issues queue too; bd ready filters them at dispatch time.
        let mut candidates: Vec<&convoy::TrackedIssue> = Vec::new();
        let mut skipped_closed = 0;
        let mut skipped_assigned = 0;
        let mut skipped_queued = 0;

        for issue in &tracked {
            if issue.status == "closed" || issue.status == "tombstone" {
                skipped_closed += 1;
                continue;
            }
            if !issue.assignee.is_empty() && !self.force {
                skipped_assigned += 1;
                continue;
            }
            if beads::has_queued_label(&issue.labels) {
                skipped_queued += 1;
                continue;
            }
            candidates.push(issue);
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
                Some(s) => println!("No issues to queue from convoy {} ({s})", self.convoy_id),
                None => println!("No issues to queue from convoy {}", self.convoy_id),
            }
            return Ok(());
        }

        if self.dry_run {
            println!(
                "📋 Would queue {} issue(s) from convoy {} → {}:",
                candidates.len(),
                self.convoy_id,
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
            "📋 Queuing {} issue(s) from convoy {} → {}...",
            candidates.len(),
            self.convoy_id,
            self.rig
        );

        let opts = EnqueueOptions {
            formula: DEFAULT_WORK_FORMULA.to_string(),
            no_convoy: true, // already tracked by this convoy
            force: self.force,
            ..Default::default()
        };
        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let success = enqueue::enqueue_batch(&town_root, &ids, &self.rig, &opts);

        println!(
            "\n📊 Queued {success}/{} issue(s) from convoy {}",
            candidates.len(),
            self.convoy_id
        );
        if let Some(s) = skip_summary() {
            println!("  Skipped: {s}");
        }
        Ok(())
    }
}
