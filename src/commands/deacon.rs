use std::time::{Duration, Instant};

use clap::{Args, Subcommand};

use crate::idle;
use crate::workspace;

/// How often the idle sleep checks for the wake signal. Bounds wake latency
/// without busy-looping.
const WAKE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Subcommand)]
pub enum DeaconCommand {
    /// Sleep if the system is idle (patrol backoff), wake early on signal
    IdleWait(IdleWaitArgs),
}

#[derive(Debug, Args)]
pub struct IdleWaitArgs {
    /// Maximum sleep duration (caps the backoff), e.g. 90s, 2m
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    pub max: Duration,
}

impl DeaconCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::IdleWait(args) => args.execute(),
        }
    }
}

impl IdleWaitArgs {
    /// Sleep for the daemon-recommended backoff interval while the system
    /// is idle. Returns immediately when active; returns early (within one
    /// poll tick) when a wake signal appears.
    pub fn execute(&self) -> anyhow::Result<()> {
        let town_root = workspace::find_from_cwd_or_error()?;

        let Some(state) = idle::read_idle_state(&town_root) else {
            println!("○ System active, no wait needed");
            return Ok(());
        };
        if !state.idle {
            println!("○ System active, no wait needed");
            return Ok(());
        }

        let sleep = state
            .backoff_interval()
            .max(idle::MIN_BACKOFF)
            .min(self.max);

        println!("○ System idle, sleeping {}s (backoff)", sleep.as_secs());

        let deadline = Instant::now() + sleep;
        loop {
            std::thread::sleep(WAKE_POLL_INTERVAL.min(sleep));
            if idle::idle_wake_path(&town_root).exists() {
                println!("▶ Wake signal detected, returning early");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
        }
    }
}

/// Parse "30s" / "2m" / "1h" style durations; a bare number is seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, multiplier) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 1),
        Some('m') => (&s[..s.len() - 1], 60),
        Some('h') => (&s[..s.len() - 1], 3600),
        Some(c) if c.is_ascii_digit() => (s, 1),
        _ => return Err(format!("invalid duration: {s:?}")),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    Ok(Duration::from_secs(value * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5x").is_err());
    }
}
