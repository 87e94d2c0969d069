use chrono::{SecondsFormat, Utc};

/// Delimiter line that starts a queue metadata block inside a bead
/// description. Namespaced and versioned so it cannot collide with generic
/// markdown separators in user content; a future format bumps to v2 while
/// v1 stays parseable.
pub const METADATA_DELIMITER: &str = "---gt:queue:v1---";

/// Queue dispatch parameters stored in a bead's description.
///
/// Written at enqueue time, consumed at dispatch time, so the two can run in
/// different processes. All fields except `target_rig` and `enqueued_at` are
/// optional and omitted from the wire form when empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetadata {
    pub target_rig: String,
    pub formula: String,
    pub args: String,
    /// Newline-separated key=value pairs. One `var:` line per pair on the
    /// wire; values may contain commas, so a joined list would be lossy.
    pub vars: String,
    pub enqueued_at: String,
    pub merge: String,
    pub convoy: String,
    pub base_branch: String,
    pub no_merge: bool,
    pub account: String,
    pub agent: String,
    pub hook_raw_bead: bool,
    pub owned: bool,
    pub dispatch_failures: u32,
    pub last_failure: String,
}

impl QueueMetadata {
    /// Create metadata for a fresh enqueue, stamped with the current time.
    pub fn new(rig_name: &str) -> Self {
        Self {
            target_rig: rig_name.to_string(),
            enqueued_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ..Self::default()
        }
    }

    /// Format as the delimited key-value block appended to a description.
    /// Only non-empty fields are emitted; booleans only when true.
    pub fn format(&self) -> String {
        let mut lines = vec![METADATA_DELIMITER.to_string()];

        if !self.target_rig.is_empty() {
            lines.push(format!("target_rig: {}", self.target_rig));
        }
        if !self.formula.is_empty() {
            lines.push(format!("formula: {}", self.formula));
        }
        if !self.args.is_empty() {
            lines.push(format!("args: {}", self.args));
        }
        for v in self.vars.split('\n') {
            let v = v.trim();
            if !v.is_empty() {
                lines.push(format!("var: {v}"));
            }
        }
        if !self.enqueued_at.is_empty() {
            lines.push(format!("enqueued_at: {}", self.enqueued_at));
        }
        if !self.merge.is_empty() {
            lines.push(format!("merge: {}", self.merge));
        }
        if !self.convoy.is_empty() {
            lines.push(format!("convoy: {}", self.convoy));
        }
        if !self.base_branch.is_empty() {
            lines.push(format!("base_branch: {}", self.base_branch));
        }
        if self.no_merge {
            lines.push("no_merge: true".to_string());
        }
        if !self.account.is_empty() {
            lines.push(format!("account: {}", self.account));
        }
        if !self.agent.is_empty() {
            lines.push(format!("agent: {}", self.agent));
        }
        if self.hook_raw_bead {
            lines.push("hook_raw_bead: true".to_string());
        }
        if self.owned {
            lines.push("owned: true".to_string());
        }
        if self.dispatch_failures > 0 {
            lines.push(format!("dispatch_failures: {}", self.dispatch_failures));
        }
        if !self.last_failure.is_empty() {
            lines.push(format!("last_failure: {}", self.last_failure));
        }

        lines.join("\n")
    }

    /// Extract queue metadata from a bead description. Returns None when no
    /// delimiter is present.
    pub fn parse(description: &str) -> Option<Self> {
        let idx = description.find(METADATA_DELIMITER)?;
        let section = &description[idx + METADATA_DELIMITER.len()..];

        let mut m = Self::default();
        let mut var_lines: Vec<String> = Vec::new();

        for line in section.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // A second delimiter terminates the block (delimiter text may
            // also appear in user content below the metadata).
            if line == METADATA_DELIMITER {
                break;
            }

            let Some((key, val)) = line.split_once(": ") else {
                continue;
            };
            let key = key.trim();
            let val = val.trim();

            match key {
                "target_rig" => m.target_rig = val.to_string(),
                "formula" => m.formula = val.to_string(),
                "args" => m.args = val.to_string(),
                "var" => var_lines.push(val.to_string()),
                // Legacy: comma-separated format for backward compatibility
                "vars" => var_lines.extend(val.split(',').map(str::to_string)),
                "enqueued_at" => m.enqueued_at = val.to_string(),
                "merge" => m.merge = val.to_string(),
                "convoy" => m.convoy = val.to_string(),
                "base_branch" => m.base_branch = val.to_string(),
                "no_merge" => m.no_merge = val == "true",
                "account" => m.account = val.to_string(),
                "agent" => m.agent = val.to_string(),
                "hook_raw_bead" => m.hook_raw_bead = val == "true",
                // Legacy: ignored. Dispatch always forces no-boot.
                "no_boot" => {}
                "owned" => m.owned = val == "true",
                // On parse error the counter stays 0. The gt:dispatch-failed
                // label (added when the counter hits max) is an independent
                // guard, since quarantine also removes gt:queued.
                "dispatch_failures" => m.dispatch_failures = val.parse().unwrap_or(0),
                "last_failure" => m.last_failure = val.to_string(),
                // Unknown keys are ignored for forward compatibility.
                _ => {}
            }
        }

        if !var_lines.is_empty() {
            m.vars = var_lines.join("\n");
        }

        Some(m)
    }
}

/// Remove the metadata block from a bead description, trimming trailing
/// newlines left behind. Used when dequeuing a bead on successful dispatch.
pub fn strip_metadata(description: &str) -> &str {
    match description.find(METADATA_DELIMITER) {
        Some(idx) => description[..idx].trim_end_matches('\n'),
        None => description,
    }
}

/// Split a newline-separated vars string into individual key=value pairs.
pub fn split_vars(vars: &str) -> Vec<String> {
    vars.split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_metadata() -> QueueMetadata {
        QueueMetadata {
            target_rig: "myrig".to_string(),
            formula: "mol-polecat-work".to_string(),
            args: "implement feature X".to_string(),
            vars: "a=1\nb=2".to_string(),
            enqueued_at: "2026-01-15T10:00:00Z".to_string(),
            merge: "direct".to_string(),
            convoy: "hq-cv-test".to_string(),
            base_branch: "develop".to_string(),
            no_merge: true,
            account: "acme".to_string(),
            agent: "gemini".to_string(),
            hook_raw_bead: true,
            owned: true,
            dispatch_failures: 2,
            last_failure: "sling failed: timeout".to_string(),
        }
    }

    #[test]
    fn format_all_fields() {
        let result = full_metadata().format();

        assert!(
            result.starts_with(METADATA_DELIMITER),
            "expected delimiter prefix, got:\n{result}"
        );

        for want in [
            "target_rig: myrig",
            "formula: mol-polecat-work",
            "args: implement feature X",
            "var: a=1",
            "var: b=2",
            "enqueued_at: 2026-01-15T10:00:00Z",
            "merge: direct",
            "convoy: hq-cv-test",
            "base_branch: develop",
            "no_merge: true",
            "account: acme",
            "agent: gemini",
            "hook_raw_bead: true",
            "owned: true",
            "dispatch_failures: 2",
            "last_failure: sling failed: timeout",
        ] {
            assert!(result.contains(want), "missing {want:?} in:\n{result}");
        }
    }

    #[test]
    fn format_minimal_fields_omits_empty() {
        let m = QueueMetadata {
            target_rig: "prod".to_string(),
            enqueued_at: "2026-01-15T10:00:00Z".to_string(),
            ..Default::default()
        };

        let result = m.format();
        assert!(result.contains("target_rig: prod"));
        assert!(result.contains("enqueued_at: 2026-01-15T10:00:00Z"));

        for absent in [
            "formula:",
            "args:",
            "var:",
            "merge:",
            "convoy:",
            "base_branch:",
            "no_merge:",
            "account:",
            "agent:",
            "hook_raw_bead:",
            "owned:",
            "dispatch_failures:",
            "last_failure:",
        ] {
            assert!(
                !result.contains(absent),
                "should not contain {absent:?} when field is empty:\n{result}"
            );
        }
    }

    #[test]
    fn format_bools_only_when_true() {
        let m = QueueMetadata {
            target_rig: "rig1".to_string(),
            enqueued_at: "2026-01-15T10:00:00Z".to_string(),
            no_merge: true,
            hook_raw_bead: true,
            owned: true,
            ..Default::default()
        };
        let result = m.format();
        for want in ["no_merge: true", "hook_raw_bead: true", "owned: true"] {
            assert!(result.contains(want), "missing {want:?}:\n{result}");
        }

        let m2 = QueueMetadata {
            target_rig: "rig1".to_string(),
            enqueued_at: "2026-01-15T10:00:00Z".to_string(),
            ..Default::default()
        };
        let result2 = m2.format();
        for absent in ["no_merge:", "hook_raw_bead:", "owned:"] {
            assert!(
                !result2.contains(absent),
                "should not contain {absent:?} when bool is false:\n{result2}"
            );
        }
    }

    #[test]
    fn round_trip() {
        let original = full_metadata();
        let parsed = QueueMetadata::parse(&original.format()).expect("parse returned None");
        assert_eq!(parsed, original);
    }

    #[test]
    fn parse_no_delimiter() {
        assert_eq!(
            QueueMetadata::parse("Just a regular description without queue metadata"),
            None
        );
    }

    #[test]
    fn parse_with_preamble() {
        let desc = "This is a task description.\nIt has multiple lines.\n---gt:queue:v1---\ntarget_rig: myrig\nformula: test-formula\nenqueued_at: 2026-01-15T10:00:00Z";

        let parsed = QueueMetadata::parse(desc).unwrap();
        assert_eq!(parsed.target_rig, "myrig");
        assert_eq!(parsed.formula, "test-formula");
        assert_eq!(parsed.enqueued_at, "2026-01-15T10:00:00Z");
    }

    #[test]
    fn parse_ignores_unknown_keys() {
        let desc = "---gt:queue:v1---\ntarget_rig: rig1\nfuture_field: xyz\nenqueued_at: 2026-01-15T10:00:00Z\nanother_unknown: 42";

        let parsed = QueueMetadata::parse(desc).unwrap();
        assert_eq!(parsed.target_rig, "rig1");
        assert_eq!(parsed.enqueued_at, "2026-01-15T10:00:00Z");
    }

    #[test]
    fn parse_stops_at_second_delimiter() {
        let desc = "---gt:queue:v1---\ntarget_rig: rig1\nenqueued_at: 2026-01-15T10:00:00Z\n---gt:queue:v1---\ntarget_rig: should-be-ignored";

        let parsed = QueueMetadata::parse(desc).unwrap();
        assert_eq!(parsed.target_rig, "rig1");
    }

    #[test]
    fn parse_legacy_vars_line() {
        let desc = "---gt:queue:v1---\ntarget_rig: rig1\nvars: a=1,b=2\nenqueued_at: 2026-01-15T10:00:00Z";

        let parsed = QueueMetadata::parse(desc).unwrap();
        assert_eq!(parsed.vars, "a=1\nb=2");
    }

    #[test]
    fn parse_preserves_colons_in_values() {
        let desc = "---gt:queue:v1---\ntarget_rig: rig1\nlast_failure: sling failed: exit 4: rig not found";

        let parsed = QueueMetadata::parse(desc).unwrap();
        assert_eq!(parsed.last_failure, "sling failed: exit 4: rig not found");
    }

    #[test]
    fn parse_corrupted_failure_counter_defaults_to_zero() {
        let desc = "---gt:queue:v1---\ntarget_rig: rig1\ndispatch_failures: not_a_number\nenqueued_at: 2026-01-15T10:00:00Z";

        let parsed = QueueMetadata::parse(desc).unwrap();
        assert_eq!(parsed.dispatch_failures, 0);
    }

    #[test]
    fn strip_removes_block() {
        let preamble = "Task description here";
        let desc = format!(
            "{preamble}\n---gt:queue:v1---\ntarget_rig: rig1\nenqueued_at: 2026-01-15T10:00:00Z"
        );
        assert_eq!(strip_metadata(&desc), preamble);
    }

    #[test]
    fn strip_without_metadata_is_identity() {
        let desc = "Just a regular description";
        assert_eq!(strip_metadata(desc), desc);
    }

    #[test]
    fn strip_delimiter_only() {
        let desc = "---gt:queue:v1---\ntarget_rig: rig1\nenqueued_at: 2026-01-15T10:00:00Z";
        assert_eq!(strip_metadata(desc), "");
    }

    #[test]
    fn strip_double_delimiter() {
        let desc = "Task desc\n---gt:queue:v1---\ntarget_rig: rig1\n---gt:queue:v1---\ntarget_rig: rig2";
        assert_eq!(strip_metadata(desc), "Task desc");
    }

    #[test]
    fn strip_delimiter_in_user_content() {
        // If user content contains the delimiter text, strip removes from
        // the first occurrence. Known edge case; the delimiter is chosen to
        // be unlikely in real descriptions.
        let desc = "User wrote ---gt:queue:v1--- as text\n---gt:queue:v1---\ntarget_rig: rig1";
        assert_eq!(strip_metadata(desc), "User wrote ");
    }

    #[test]
    fn strip_is_idempotent() {
        let desc = "Task desc\n---gt:queue:v1---\ntarget_rig: rig1";
        let once = strip_metadata(desc);
        assert_eq!(strip_metadata(once), once);
    }

    #[test]
    fn new_sets_rig_and_timestamp() {
        let before = Utc::now();
        let m = QueueMetadata::new("test-rig");
        let after = Utc::now();

        assert_eq!(m.target_rig, "test-rig");

        let ts = chrono::DateTime::parse_from_rfc3339(&m.enqueued_at)
            .expect("enqueued_at is not valid RFC3339")
            .with_timezone(&Utc);
        assert!(ts >= before - chrono::Duration::seconds(1));
        assert!(ts <= after + chrono::Duration::seconds(1));
    }

    #[test]
    fn split_vars_cases() {
        assert!(split_vars("").is_empty());
        assert_eq!(split_vars("a=1"), vec!["a=1"]);
        assert_eq!(split_vars("a=1\nb=2"), vec!["a=1", "b=2"]);
        assert_eq!(
            split_vars("x=hello\ny=world\nz=42"),
            vec!["x=hello", "y=world", "z=42"]
        );
        assert_eq!(split_vars("a=1\n\nb=2\n"), vec!["a=1", "b=2"]);
        assert_eq!(split_vars("  a=1  \n  b=2  "), vec!["a=1", "b=2"]);
    }
}
