//! Usage limit state for Claude Pro/Max sessions.
//!
//! When a worker session hits an API usage limit it stops processing. A
//! Stop hook runs `gt usagelimit record`, which scans the session transcript
//! for limit messages and persists when the limit should reset. The daemon
//! checks the state each heartbeat and wakes agents once the reset has
//! passed, with a bounded number of attempts so a persistent limit cannot
//! cause an infinite wake loop.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Buffer after the reset time before waking agents. Covers clock skew and
/// lets the API fully reset.
pub const WAKE_BUFFER: Duration = Duration::from_secs(2 * 60);

/// Maximum wake attempts before giving up and waiting for an operator.
pub const MAX_WAKE_ATTEMPTS: u32 = 3;

/// Minimum time between wake attempts.
pub const WAKE_ATTEMPT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// The current usage limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLimitState {
    /// True if a usage limit is currently in effect.
    pub active: bool,

    /// When the limit is expected to reset. The daemon attempts wakes after
    /// this time (plus buffer).
    pub reset_at: DateTime<Utc>,

    /// When this limit was recorded.
    pub recorded_at: DateTime<Utc>,

    /// Who recorded it: a session name, "daemon", "manual", ...
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recorded_by: String,

    /// Matched pattern context, e.g. "Anthropic API rate_limit_error".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Wake attempts made since the reset passed.
    #[serde(default)]
    pub wake_attempts: u32,

    /// When the last wake attempt was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_wake_attempt: Option<DateTime<Utc>>,
}

/// Path to the usage limit state file.
pub fn state_path(town_root: &Path) -> PathBuf {
    town_root
        .join(".runtime")
        .join("ratelimit")
        .join("state.json")
}

/// Load the state. Returns None when no limit has been recorded.
pub fn load_state(town_root: &Path) -> anyhow::Result<Option<UsageLimitState>> {
    let path = state_path(town_root);
    let data = match std::fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("reading {}", path.display()));
        }
    };
    let state = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(state))
}

/// Save the state, creating the ratelimit directory on first use.
pub fn save_state(town_root: &Path, state: &UsageLimitState) -> anyhow::Result<()> {
    let path = state_path(town_root);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let data = serde_json::to_string_pretty(state).context("serializing usage limit state")?;
    std::fs::write(&path, data).with_context(|| format!("writing {}", path.display()))
}

/// Remove the state file. Missing file is not an error.
pub fn clear_state(town_root: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(state_path(town_root)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context("removing usage limit state")),
    }
}

/// Record a freshly detected usage limit.
pub fn record_usage_limit(
    town_root: &Path,
    reset_duration: Duration,
    recorded_by: &str,
    reason: &str,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let state = UsageLimitState {
        active: true,
        reset_at: now + chrono::Duration::from_std(reset_duration).unwrap_or(chrono::Duration::hours(1)),
        recorded_at: now,
        recorded_by: recorded_by.to_string(),
        reason: reason.to_string(),
        wake_attempts: 0,
        last_wake_attempt: None,
    };
    save_state(town_root, &state)
}

/// True if a recorded limit is active and its reset time has not passed.
pub fn is_limited(town_root: &Path) -> bool {
    match load_state(town_root) {
        Ok(Some(state)) => state.active && Utc::now() < state.reset_at,
        _ => false,
    }
}

impl UsageLimitState {
    /// Whether it is time to wake agents: the limit is active, the reset
    /// (plus buffer) has passed, attempts remain, and the cooldown since the
    /// last attempt has elapsed.
    pub fn should_wake(&self) -> bool {
        if !self.active {
            return false;
        }

        let wake_time = self.reset_at + chrono::Duration::seconds(WAKE_BUFFER.as_secs() as i64);
        if Utc::now() < wake_time {
            return false;
        }

        if self.wake_attempts >= MAX_WAKE_ATTEMPTS {
            return false;
        }

        if let Some(last) = self.last_wake_attempt {
            let cooldown = chrono::Duration::seconds(WAKE_ATTEMPT_COOLDOWN.as_secs() as i64);
            if Utc::now() - last < cooldown {
                return false;
            }
        }

        true
    }

    /// Record that a wake attempt was made.
    pub fn record_wake_attempt(&mut self) {
        self.wake_attempts += 1;
        self.last_wake_attempt = Some(Utc::now());
    }
}

/// Usage limit indicators, ordered by specificity: official API error types
/// first, then HTTP codes, then user-facing phrasings. First match wins.
const USAGE_LIMIT_PATTERNS: &[(&str, &str)] = &[
    // Official Anthropic API error type (most specific)
    ("rate_limit_error", "Anthropic API rate_limit_error"),
    // HTTP status code
    ("status.*429", "HTTP 429 Too Many Requests"),
    ("error.*429", "HTTP 429 error"),
    ("429", "HTTP 429"),
    // API overload error (related but distinct)
    ("overloaded_error", "Anthropic API overloaded_error (529)"),
    // Rate limit phrases
    ("rate limit", "rate limit detected"),
    ("ratelimit", "ratelimit detected"),
    ("too many requests", "too many requests"),
    // Usage/subscription limits (Claude Pro/Max)
    ("usage limit", "usage limit reached"),
    ("you've reached your limit", "subscription limit reached"),
    ("you have reached your limit", "subscription limit reached"),
    ("exceeded your limit", "limit exceeded"),
    ("reached your usage limit", "usage limit reached"),
    ("usage cap", "usage cap reached"),
    // Token limits
    ("token limit", "token limit reached"),
    ("tokens per minute", "TPM limit"),
    ("requests per minute", "RPM limit"),
    // Generic
    ("api limit", "API limit"),
    ("request limit", "request limit"),
];

/// Scan transcript content for usage limit indicators.
/// Returns (reset_duration, reason) when a limit is detected.
pub fn detect_usage_limit(transcript: &str) -> Option<(Duration, String)> {
    let lower = transcript.to_lowercase();

    let mut reason = None;
    for (pattern, desc) in USAGE_LIMIT_PATTERNS {
        let matched = if pattern.contains(".*") {
            // The two status patterns need a regex; everything else is a
            // plain substring.
            Regex::new(pattern).ok()?.is_match(&lower)
        } else {
            lower.contains(pattern)
        };
        if matched {
            reason = Some(desc.to_string());
            break;
        }
    }
    let mut reason = reason?;

    let reset_duration = match extract_reset_duration(transcript) {
        Some(d) => d,
        None => {
            // Claude Pro/Max limits typically reset hourly.
            reason.push_str(" (default 1h reset)");
            Duration::from_secs(3600)
        }
    };

    Some((reset_duration, reason))
}

static RETRY_AFTER_SECS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"retry-after["']?[:\s]+(\d+)"#).expect("valid regex"));
static RETRY_AFTER_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"retry[- ]?after[:\s]+(\d+)\s*(second|minute|hour|sec|min|hr|s|m|h)")
        .expect("valid regex")
});
static RESET_TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"ratelimit-\w+-reset["']?:\s*["']?(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z?)"#)
        .expect("valid regex")
});
static IN_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:reset|available|try again|wait)\s+(?:in\s+)?(\d+)\s*(second|minute|hour|sec|min|hr|s|m|h)")
        .expect("valid regex")
});
static AT_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:reset|available)\s+at\s+(\d{1,2}):(\d{2})").expect("valid regex"));

/// Parse a reset duration out of transcript text. Handles, in order:
/// retry-after header seconds, human-readable "retry after N unit",
/// RFC3339 ratelimit reset headers, "in N unit" phrasings, and absolute
/// "reset at HH:MM" times (rolled to tomorrow when already past).
pub fn extract_reset_duration(transcript: &str) -> Option<Duration> {
    let lower = transcript.to_lowercase();

    // retry-after header with bare seconds (API standard), e.g.
    // "retry-after: 60" or "retry-after\":60"
    if let Some(caps) = RETRY_AFTER_SECS_RE.captures(&lower) {
        if let Ok(value) = caps[1].parse::<u64>() {
            // Sanity cap: less than 24 hours
            if value > 0 && value < 86400 {
                return Some(Duration::from_secs(value));
            }
        }
    }

    // "retry after 5 minutes" (human readable)
    if let Some(caps) = RETRY_AFTER_UNIT_RE.captures(&lower) {
        if let Some(d) = duration_from_unit(&caps[1], &caps[2]) {
            return Some(d);
        }
    }

    // Anthropic reset timestamp header (RFC3339), e.g.
    // "anthropic-ratelimit-tokens-reset: 2026-01-29T12:00:00Z". A timestamp,
    // not a duration: convert via reset − now.
    if let Some(caps) = RESET_TIMESTAMP_RE.captures(transcript) {
        let raw = &caps[1];
        let ts = DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
            .or_else(|| {
                // Header may omit the zone; assume UTC.
                chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                    .ok()
                    .map(|t| t.and_utc())
            });
        if let Some(reset) = ts {
            let until = reset - Utc::now();
            if until > chrono::Duration::zero() {
                return until.to_std().ok();
            }
        }
    }

    // "reset in 30 minutes", "try again in 2 hours"
    if let Some(caps) = IN_TIME_RE.captures(&lower) {
        if let Some(d) = duration_from_unit(&caps[1], &caps[2]) {
            return Some(d);
        }
    }

    // "reset at 14:30" — duration until that wall-clock time, rolling over
    // to tomorrow if already past.
    if let Some(caps) = AT_TIME_RE.captures(&lower) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        if hour < 24 && minute < 60 {
            let now = chrono::Local::now();
            let mut reset = now
                .date_naive()
                .and_hms_opt(hour, minute, 0)?
                .and_local_timezone(now.timezone())
                .single()?;
            if reset < now {
                reset = reset + chrono::Duration::hours(24);
            }
            return (reset - now).to_std().ok();
        }
    }

    None
}

fn duration_from_unit(value: &str, unit: &str) -> Option<Duration> {
    let value: u64 = value.parse().ok()?;
    let secs = match unit.chars().next()? {
        's' => value,
        'm' => value * 60,
        'h' => value * 3600,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Partial shape of a structured Claude Code transcript.
#[derive(Debug, Deserialize)]
struct Transcript {
    #[serde(default)]
    messages: Vec<TranscriptMessage>,
}

#[derive(Debug, Deserialize)]
struct TranscriptMessage {
    #[serde(default)]
    content: serde_json::Value,
}

/// Read the most recent Claude Code transcript for a working directory.
///
/// Transcripts live under `~/.claude/projects/<workdir-with-dashes>/`. The
/// newest `*.json` file wins. Structured transcripts yield their message
/// text; anything that fails to parse as JSON is returned raw, since the
/// detector only needs substring matches.
pub fn read_transcript(work_dir: &str) -> anyhow::Result<String> {
    let home = std::env::var("HOME").context("HOME is not set")?;

    let mut project_path = work_dir.replace('/', "-");
    if let Some(stripped) = project_path.strip_prefix('-') {
        project_path = stripped.to_string();
    }

    let transcript_dir = PathBuf::from(home)
        .join(".claude")
        .join("projects")
        .join(project_path);

    let entries = std::fs::read_dir(&transcript_dir)
        .with_context(|| format!("reading transcript dir {}", transcript_dir.display()))?;

    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if latest.as_ref().is_none_or(|(t, _)| modified > *t) {
            latest = Some((modified, path));
        }
    }

    let (_, path) = latest.context("no transcript files found")?;
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;

    let Ok(transcript) = serde_json::from_str::<Transcript>(&data) else {
        return Ok(data);
    };

    let mut content = String::new();
    for msg in transcript.messages {
        match msg.content {
            serde_json::Value::String(s) => {
                content.push_str(&s);
                content.push('\n');
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                        content.push_str(text);
                        content.push('\n');
                    }
                }
            }
            _ => {}
        }
    }
    Ok(content)
}

/// Human-friendly remaining-time rendering for status output.
pub fn format_remaining(until_reset: chrono::Duration) -> String {
    if until_reset < chrono::Duration::zero() {
        return "expired".to_string();
    }
    let secs = until_reset.num_seconds();
    if secs < 60 {
        return format!("{secs} seconds");
    }
    if secs < 3600 {
        return format!("{} minutes", secs / 60);
    }
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if minutes == 0 {
        format!("{hours} hours")
    } else {
        format!("{hours}h {minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_state() -> UsageLimitState {
        UsageLimitState {
            active: true,
            reset_at: Utc::now() - chrono::Duration::hours(1),
            recorded_at: Utc::now() - chrono::Duration::hours(2),
            recorded_by: "test".to_string(),
            reason: "test limit".to_string(),
            wake_attempts: 0,
            last_wake_attempt: None,
        }
    }

    #[test]
    fn state_file_path() {
        assert_eq!(
            state_path(Path::new("/home/user/gt")),
            Path::new("/home/user/gt/.runtime/ratelimit/state.json")
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();

        let state = UsageLimitState {
            active: true,
            reset_at: Utc::now() + chrono::Duration::hours(1),
            recorded_at: Utc::now(),
            recorded_by: "test".to_string(),
            reason: "test rate limit".to_string(),
            wake_attempts: 1,
            last_wake_attempt: Some(Utc::now() - chrono::Duration::minutes(5)),
        };
        save_state(tmp.path(), &state).unwrap();

        let loaded = load_state(tmp.path()).unwrap().expect("state missing");
        assert!(loaded.active);
        assert_eq!(loaded.recorded_by, "test");
        assert_eq!(loaded.reason, "test rate limit");
        assert_eq!(loaded.wake_attempts, 1);
        assert_eq!(
            loaded.reset_at.timestamp(),
            state.reset_at.timestamp(),
            "reset_at should survive the round trip"
        );
    }

    #[test]
    fn load_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_state(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn clear_removes_state() {
        let tmp = tempfile::tempdir().unwrap();
        save_state(tmp.path(), &base_state()).unwrap();

        clear_state(tmp.path()).unwrap();
        assert!(!state_path(tmp.path()).exists());

        // Clearing a missing file is not an error.
        clear_state(tmp.path()).unwrap();
    }

    #[test]
    fn record_sets_reset_from_duration() {
        let tmp = tempfile::tempdir().unwrap();

        record_usage_limit(tmp.path(), Duration::from_secs(300), "gt-rig-toast", "HTTP 429")
            .unwrap();

        let state = load_state(tmp.path()).unwrap().unwrap();
        assert!(state.active);
        assert_eq!(state.recorded_by, "gt-rig-toast");
        let until = state.reset_at - Utc::now();
        assert!(until > chrono::Duration::minutes(4));
        assert!(until <= chrono::Duration::minutes(5));
        assert!(is_limited(tmp.path()));
    }

    #[test]
    fn should_wake_requires_active() {
        let state = UsageLimitState {
            active: false,
            ..base_state()
        };
        assert!(!state.should_wake());
    }

    #[test]
    fn should_wake_waits_for_reset() {
        let state = UsageLimitState {
            reset_at: Utc::now() + chrono::Duration::hours(1),
            ..base_state()
        };
        assert!(!state.should_wake());
    }

    #[test]
    fn should_wake_respects_buffer() {
        // Reset just passed but the two-minute buffer has not.
        let state = UsageLimitState {
            reset_at: Utc::now() - chrono::Duration::seconds(30),
            ..base_state()
        };
        assert!(!state.should_wake());
    }

    #[test]
    fn should_wake_after_reset_plus_buffer() {
        let state = UsageLimitState {
            reset_at: Utc::now() - chrono::Duration::minutes(5),
            ..base_state()
        };
        assert!(state.should_wake());
    }

    #[test]
    fn should_wake_stops_after_max_attempts() {
        let state = UsageLimitState {
            wake_attempts: MAX_WAKE_ATTEMPTS,
            ..base_state()
        };
        assert!(!state.should_wake());
    }

    #[test]
    fn should_wake_honors_cooldown() {
        let mut state = UsageLimitState {
            wake_attempts: 1,
            last_wake_attempt: Some(Utc::now() - chrono::Duration::minutes(1)),
            ..base_state()
        };
        assert!(!state.should_wake());

        state.last_wake_attempt = Some(Utc::now() - chrono::Duration::minutes(6));
        assert!(state.should_wake());
    }

    #[test]
    fn record_wake_attempt_increments() {
        let mut state = base_state();
        state.record_wake_attempt();
        assert_eq!(state.wake_attempts, 1);
        assert!(state.last_wake_attempt.is_some());
    }

    #[test]
    fn detect_official_error_type() {
        let (duration, reason) =
            detect_usage_limit(r#"{"type":"error","error":{"type":"rate_limit_error"}} retry-after: 300"#)
                .expect("should detect");
        assert_eq!(reason, "Anthropic API rate_limit_error");
        assert_eq!(duration, Duration::from_secs(300));
    }

    #[test]
    fn detect_http_429() {
        let (_, reason) = detect_usage_limit("request failed with status: 429").unwrap();
        assert!(
            reason.starts_with("HTTP 429 Too Many Requests"),
            "reason: {reason}"
        );
    }

    #[test]
    fn detect_subscription_phrase() {
        let (duration, reason) =
            detect_usage_limit("You've reached your limit for today.").unwrap();
        assert_eq!(reason, "subscription limit reached (default 1h reset)");
        assert_eq!(duration, Duration::from_secs(3600));
    }

    #[test]
    fn detect_most_specific_pattern_wins() {
        // Contains both the official type and a generic phrase; the official
        // type is listed first and must win.
        let (_, reason) =
            detect_usage_limit("rate_limit_error: you have hit a rate limit").unwrap();
        assert!(
            reason.starts_with("Anthropic API rate_limit_error"),
            "reason: {reason}"
        );
    }

    #[test]
    fn detect_nothing_in_clean_transcript() {
        assert!(detect_usage_limit("All tests passed. Work complete.").is_none());
    }

    #[test]
    fn extract_retry_after_seconds() {
        assert_eq!(
            extract_reset_duration("retry-after: 60"),
            Some(Duration::from_secs(60))
        );
        // JSON-embedded form
        assert_eq!(
            extract_reset_duration(r#""retry-after":120"#),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn extract_retry_after_sanity_cap() {
        // 24h+ values are implausible header seconds; fall through.
        assert_eq!(extract_reset_duration("retry-after: 100000"), None);
    }

    #[test]
    fn extract_retry_after_human() {
        assert_eq!(
            extract_reset_duration("please retry after 5 minutes"),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            extract_reset_duration("retry after 2 hours"),
            Some(Duration::from_secs(7200))
        );
    }

    #[test]
    fn extract_reset_timestamp_header() {
        let reset = Utc::now() + chrono::Duration::minutes(10);
        let transcript = format!(
            "anthropic-ratelimit-tokens-reset: {}",
            reset.format("%Y-%m-%dT%H:%M:%SZ")
        );
        let duration = extract_reset_duration(&transcript).expect("should parse");
        assert!(duration > Duration::from_secs(9 * 60));
        assert!(duration <= Duration::from_secs(10 * 60));
    }

    #[test]
    fn extract_past_timestamp_falls_through() {
        let transcript = "anthropic-ratelimit-tokens-reset: 2020-01-01T00:00:00Z";
        assert_eq!(extract_reset_duration(transcript), None);
    }

    #[test]
    fn extract_in_time_phrases() {
        assert_eq!(
            extract_reset_duration("usage will reset in 30 minutes"),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(
            extract_reset_duration("try again in 45 sec"),
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn extract_at_time_is_bounded_by_a_day() {
        let duration = extract_reset_duration("your limit will reset at 14:30").expect("parses");
        assert!(duration <= Duration::from_secs(24 * 3600));
    }

    #[test]
    fn format_remaining_rendering() {
        assert_eq!(format_remaining(chrono::Duration::seconds(-5)), "expired");
        assert_eq!(format_remaining(chrono::Duration::seconds(45)), "45 seconds");
        assert_eq!(format_remaining(chrono::Duration::minutes(30)), "30 minutes");
        assert_eq!(format_remaining(chrono::Duration::hours(2)), "2 hours");
        assert_eq!(
            format_remaining(chrono::Duration::minutes(150)),
            "2h 30m"
        );
    }

    #[test]
    fn transcript_text_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let work_dir = "/tmp/gt/rigs/demo";
        let project_dir = tmp
            .path()
            .join(".claude")
            .join("projects")
            .join("tmp-gt-rigs-demo");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("session.json"),
            r#"{"messages":[{"content":"hello"},{"content":[{"type":"text","text":"rate_limit_error seen"}]}]}"#,
        )
        .unwrap();

        // Scope HOME to this test's tempdir.
        let prev_home = std::env::var("HOME").ok();
        std::env::set_var("HOME", tmp.path());
        let text = read_transcript(work_dir).unwrap();
        if let Some(home) = prev_home {
            std::env::set_var("HOME", home);
        }

        assert!(text.contains("hello"));
        assert!(text.contains("rate_limit_error seen"));
    }
}
