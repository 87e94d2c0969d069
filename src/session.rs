//! Tmux session census.
//!
//! Worker sessions follow the `gt-<rig>-<name>` naming scheme. Town-level
//! agents (mayor, deacon, daemon) have no rig segment. The census only
//! needs to tell polecats apart from everything else.

use crate::subprocess::Tool;

/// Role of a named tmux session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Mayor,
    Deacon,
    Daemon,
    Witness,
    Refinery,
    Polecat,
}

/// Identity parsed from a tmux session name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub rig: String,
    pub name: String,
    pub role: Role,
}

/// Parse a `gt-...` session name. Returns None for sessions that are not
/// ours.
pub fn parse_session_name(session: &str) -> Option<SessionIdentity> {
    let rest = session.strip_prefix("gt-")?;
    if rest.is_empty() {
        return None;
    }

    // Town-level agents have no rig segment.
    match rest {
        "mayor" => {
            return Some(SessionIdentity {
                rig: String::new(),
                name: rest.to_string(),
                role: Role::Mayor,
            })
        }
        "deacon" => {
            return Some(SessionIdentity {
                rig: String::new(),
                name: rest.to_string(),
                role: Role::Deacon,
            })
        }
        "daemon" => {
            return Some(SessionIdentity {
                rig: String::new(),
                name: rest.to_string(),
                role: Role::Daemon,
            })
        }
        _ => {}
    }

    // Rig-scoped: gt-<rig>-<name>. Rig names may contain hyphens, the
    // trailing segment is the agent name.
    let (rig, name) = rest.rsplit_once('-')?;
    if rig.is_empty() || name.is_empty() {
        return None;
    }
    let role = match name {
        "witness" => Role::Witness,
        "refinery" => Role::Refinery,
        _ => Role::Polecat,
    };
    Some(SessionIdentity {
        rig: rig.to_string(),
        name: name.to_string(),
        role,
    })
}

/// Count polecat tmux sessions across all rigs. Errors (no tmux, no server)
/// count as zero.
pub fn count_active_polecats() -> u32 {
    let output = match Tool::new("tmux")
        .args(&["list-sessions", "-F", "#{session_name}"])
        .run()
    {
        Ok(out) if out.success() => out,
        _ => return 0,
    };

    output
        .stdout
        .lines()
        .filter_map(|line| parse_session_name(line.trim()))
        .filter(|id| id.role == Role::Polecat)
        .count() as u32
}

/// Session name of a rig's witness agent.
pub fn witness_session(rig: &str) -> String {
    format!("gt-{rig}-witness")
}

/// Nudge a rig's witness session so it notices freshly spawned polecats.
/// Fire and forget: dispatch runs with boot suppressed, so the witness may
/// be asleep; a missing session or tmux error is not a failure.
pub fn wake_rig_agents(rig: &str) {
    let session = witness_session(rig);
    let result = Tool::new("tmux")
        .args(&["send-keys", "-t", &session, "", "Enter"])
        .run();
    match result {
        Ok(out) if out.success() => {
            tracing::info!("woke witness for rig {rig}");
        }
        _ => {
            tracing::debug!("could not wake witness for rig {rig} (session {session})");
        }
    }
}
