use std::process::ExitCode;

/// Errors that cause gt to exit with a specific code.
///
/// Queue operations that refuse to act (unknown rig, busy bead, bad formula)
/// get their own variants so batch callers and hooks can tell an operator
/// mistake from a broken companion tool. Per-bead dispatch failures inside a
/// batch are printed and the batch continues, so only whole-batch conditions
/// (like the store being unreachable) surface here as process exits.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("not in a Gas Town workspace: {0}")]
    NoWorkspace(String),

    #[error("'{0}' is not a known rig")]
    UnknownRig(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("bead store unreachable: all {failed_dirs} bead directories failed: {detail}")]
    StoreUnreachable { failed_dirs: usize, detail: String },

    #[error("bead {bead} is already {status} to {assignee}\nUse --force to override")]
    BeadBusy {
        bead: String,
        status: String,
        assignee: String,
    },

    #[error("bead {bead} belongs to rig '{owner}', not '{target}'\nUse --force to queue it cross-rig")]
    CrossRig {
        bead: String,
        owner: String,
        target: String,
    },

    #[error("formula {formula:?} invalid: {detail}")]
    FormulaInvalid { formula: String, detail: String },

    #[error("bead {bead} quarantined: {reason}")]
    DispatchQuarantined { bead: String, reason: String },
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::NoWorkspace(_) => ExitCode::from(2),
            ExitError::UnknownRig(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::StoreUnreachable { .. } => ExitCode::from(6),
            ExitError::BeadBusy { .. } => ExitCode::from(7),
            ExitError::CrossRig { .. } => ExitCode::from(7),
            ExitError::FormulaInvalid { .. } => ExitCode::from(8),
            ExitError::DispatchQuarantined { .. } => ExitCode::from(1),
        }
    }
}
