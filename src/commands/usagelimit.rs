use std::time::Duration;

use chrono::Utc;
use clap::{Args, Subcommand};

use crate::subprocess::Tool;
use crate::usagelimit;
use crate::workspace;

#[derive(Debug, Subcommand)]
pub enum UsagelimitCommand {
    /// Detect and record a usage limit from a session transcript (Stop hook)
    Record(RecordArgs),
    /// Show current usage limit state
    Status,
    /// Clear usage limit state
    Clear,
    /// Manually set usage limit state
    Set(SetArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Session name (e.g. gt-gastown-toast)
    #[arg(long)]
    pub session: Option<String>,
    /// Show debug output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Args)]
pub struct SetArgs {
    /// Minutes until the usage limit resets
    #[arg(short, long, default_value_t = 60)]
    pub minutes: u32,
    /// Reason for the usage limit
    #[arg(short, long, default_value = "Manual usage limit")]
    pub reason: String,
}

impl UsagelimitCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::Record(args) => args.execute(),
            Self::Status => execute_status(),
            Self::Clear => execute_clear(),
            Self::Set(args) => args.execute(),
        }
    }
}

impl RecordArgs {
    /// Designed to run from a Claude Code Stop hook: resolve the session's
    /// working directory, scan its transcript, record any detected limit.
    /// Exits quietly (success) when there is nothing to do — a Stop hook
    /// must never fail the session over missing context.
    pub fn execute(&self) -> anyhow::Result<()> {
        let session = self
            .session
            .clone()
            .or_else(|| std::env::var("GT_SESSION").ok().filter(|s| !s.is_empty()))
            .or_else(current_tmux_session);

        let work_dir = std::env::var("GT_CWD")
            .ok()
            .filter(|d| !d.is_empty())
            .or_else(|| session.as_deref().and_then(tmux_session_work_dir));

        let Some(work_dir) = work_dir else {
            if self.verbose {
                eprintln!("[usagelimit] no workdir available, cannot check transcript");
            }
            return Ok(());
        };

        let transcript = match usagelimit::read_transcript(&work_dir) {
            Ok(t) => t,
            Err(e) => {
                if self.verbose {
                    eprintln!("[usagelimit] could not read transcript: {e:#}");
                }
                return Ok(());
            }
        };

        let Some((reset_duration, reason)) = usagelimit::detect_usage_limit(&transcript) else {
            if self.verbose {
                eprintln!("[usagelimit] no usage limit detected in transcript");
            }
            return Ok(());
        };

        let town_root = workspace::find_from_cwd_or_error()?;
        let recorded_by = session.unwrap_or_else(|| "unknown".to_string());

        usagelimit::record_usage_limit(&town_root, reset_duration, &recorded_by, &reason)?;

        println!("⚠ Usage limit detected and recorded");
        println!("  Reason: {reason}");
        println!(
            "  Resets in: {}",
            usagelimit::format_remaining(
                chrono::Duration::from_std(reset_duration)
                    .unwrap_or_else(|_| chrono::Duration::zero())
            )
        );
        println!("  Recorded by: {recorded_by}");
        Ok(())
    }
}

fn execute_status() -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd_or_error()?;

    let Some(state) = usagelimit::load_state(&town_root)? else {
        println!("✓ No active usage limit");
        return Ok(());
    };
    if !state.active {
        println!("✓ No active usage limit");
        return Ok(());
    }

    if Utc::now() < state.reset_at {
        println!("⚠ Usage limit ACTIVE");
    } else {
        println!("○ Usage limit EXPIRED (awaiting wake)");
    }

    println!("\nState:");
    println!("  Reset at:       {}", state.reset_at.to_rfc3339());
    println!(
        "  Time remaining: {}",
        usagelimit::format_remaining(state.reset_at - Utc::now())
    );
    println!("  Recorded at:    {}", state.recorded_at.to_rfc3339());
    println!("  Recorded by:    {}", state.recorded_by);
    if !state.reason.is_empty() {
        println!("  Reason:         {}", state.reason);
    }
    if state.wake_attempts > 0 {
        println!("  Wake attempts:  {}", state.wake_attempts);
        if let Some(last) = state.last_wake_attempt {
            println!("  Last attempt:   {}", last.to_rfc3339());
        }
    }
    Ok(())
}

fn execute_clear() -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd_or_error()?;
    usagelimit::clear_state(&town_root)?;
    println!("✓ Usage limit state cleared");
    Ok(())
}

impl SetArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = workspace::find_from_cwd_or_error()?;

        let recorded_by = std::env::var("BD_ACTOR")
            .ok()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "manual".to_string());
        let reset_duration = Duration::from_secs(u64::from(self.minutes) * 60);

        usagelimit::record_usage_limit(&town_root, reset_duration, &recorded_by, &self.reason)?;

        println!("✓ Usage limit set");
        println!("  Resets in: {} minutes", self.minutes);
        println!("  Reason: {}", self.reason);
        Ok(())
    }
}

/// Current tmux session name, if we are inside one.
fn current_tmux_session() -> Option<String> {
    let out = Tool::new("tmux")
        .args(&["display-message", "-p", "#S"])
        .run()
        .ok()?;
    if !out.success() {
        return None;
    }
    let name = out.stdout.trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// Working directory of a tmux session's active pane.
fn tmux_session_work_dir(session: &str) -> Option<String> {
    let out = Tool::new("tmux")
        .args(&["display-message", "-t", session, "-p", "#{pane_current_path}"])
        .run()
        .ok()?;
    if !out.success() {
        return None;
    }
    let dir = out.stdout.trim().to_string();
    (!dir.is_empty()).then_some(dir)
}
