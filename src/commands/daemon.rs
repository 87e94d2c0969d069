use clap::Subcommand;

use crate::config::RigRegistry;
use crate::idle;
use crate::session;
use crate::subprocess::Tool;
use crate::usagelimit;
use crate::workspace;

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Run one daemon cycle: idle census, usage-limit wake, queue dispatch
    Heartbeat,
}

impl DaemonCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::Heartbeat => execute_heartbeat(),
        }
    }
}

/// One heartbeat of the background daemon. The persistent loop that invokes
/// this lives outside gt (systemd timer, launchd, a shell loop); keeping
/// each cycle a plain CLI call means a wedged cycle dies with its process.
fn execute_heartbeat() -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd_or_error()?;

    let state = idle::update_idle_state(&town_root)?;
    tracing::info!(
        idle = state.idle,
        polecats = state.polecat_count,
        convoys = state.convoy_count,
        backoff_secs = state.backoff_interval_secs,
        "idle census"
    );

    run_usage_limit_wake(&town_root)?;

    // Dispatch runs as a subprocess with GT_DAEMON=1 so queue.enabled can
    // tell daemon-origin dispatch apart from a manual `gt queue run`.
    let gt = std::env::current_exe().unwrap_or_else(|_| "gt".into());
    let result = Tool::new(&gt.to_string_lossy())
        .args(&["queue", "run"])
        .env("GT_DAEMON", "1")
        .env("GT_TOWN_ROOT", &town_root.to_string_lossy())
        .run();
    match result {
        Ok(out) if out.success() => {
            if !out.stdout.trim().is_empty() {
                print!("{}", out.stdout);
            }
        }
        Ok(out) => println!("Warning: queue dispatch failed: {}", out.stderr.trim()),
        Err(e) => println!("Warning: could not run queue dispatch: {e:#}"),
    }

    Ok(())
}

/// Check the usage-limit wake policy and nudge rig witnesses when a reset
/// has passed. Attempts are bounded and cooled down by the state itself.
fn run_usage_limit_wake(town_root: &std::path::Path) -> anyhow::Result<()> {
    let Some(mut state) = usagelimit::load_state(town_root)? else {
        return Ok(());
    };
    if !state.should_wake() {
        return Ok(());
    }

    println!(
        "▶ Usage limit reset passed ({}), waking agents (attempt {}/{})",
        state.reason,
        state.wake_attempts + 1,
        usagelimit::MAX_WAKE_ATTEMPTS
    );

    let rigs = RigRegistry::load(town_root)?;
    for rig in rigs.names() {
        session::wake_rig_agents(rig);
    }

    state.record_wake_attempt();
    usagelimit::save_state(town_root, &state)?;
    Ok(())
}
