use std::process::ExitCode;

use clap::{Parser, Subcommand};

use gastown::commands::convoy::ConvoyCommand;
use gastown::commands::daemon::DaemonCommand;
use gastown::commands::deacon::DeaconCommand;
use gastown::commands::queue::QueueCommand;
use gastown::commands::usagelimit::UsagelimitCommand;
use gastown::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "gt",
    version,
    about = "Deferred work queue and dispatch for multi-agent workspaces"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Work queue: run, pause, resume, epic enqueue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Convoy operations (queue tracked issues)
    Convoy {
        #[command(subcommand)]
        command: ConvoyCommand,
    },
    /// Deacon patrol helpers (idle-wait)
    Deacon {
        #[command(subcommand)]
        command: DeaconCommand,
    },
    /// Daemon cycle (heartbeat)
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Usage limit state for worker sessions
    Usagelimit {
        #[command(subcommand)]
        command: UsagelimitCommand,
    },
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Queue { .. } => "queue",
            Self::Convoy { .. } => "convoy",
            Self::Deacon { .. } => "deacon",
            Self::Daemon { .. } => "daemon",
            Self::Usagelimit { .. } => "usagelimit",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Queue { command } => command.execute(),
        Commands::Convoy { command } => command.execute(),
        Commands::Deacon { command } => command.execute(),
        Commands::Daemon { command } => command.execute(),
        Commands::Usagelimit { command } => command.execute(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
