//! Append-only NDJSON event feed for queue activity.
//!
//! Every enqueue, dispatch, and dispatch failure leaves a record at
//! `<town>/.runtime/events.ndjson`. Feed writes are best effort: an
//! unwritable feed must never fail the operation being logged, so callers
//! use [`log_feed`] which swallows errors into a warning.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

pub const TYPE_QUEUE_ENQUEUE: &str = "queue_enqueue";
pub const TYPE_QUEUE_DISPATCH: &str = "queue_dispatch";
pub const TYPE_QUEUE_DISPATCH_FAILED: &str = "queue_dispatch_failed";

#[derive(Debug, Serialize)]
struct FeedEvent<'a> {
    ts: String,
    #[serde(rename = "type")]
    event_type: &'a str,
    actor: &'a str,
    payload: Value,
}

/// Path to the event feed file.
pub fn feed_path(town_root: &Path) -> PathBuf {
    town_root.join(".runtime").join("events.ndjson")
}

/// Resolve the acting identity for feed records: BD_ACTOR, or "unknown".
pub fn detect_actor() -> String {
    std::env::var("BD_ACTOR")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Append one event to the feed, creating the file on first use.
/// Best effort: failures are logged and swallowed.
pub fn log_feed(town_root: &Path, event_type: &str, actor: &str, payload: Value) {
    let event = FeedEvent {
        ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        event_type,
        actor,
        payload,
    };

    if let Err(e) = append(town_root, &event) {
        tracing::warn!("could not append to event feed: {e:#}");
    }
}

fn append(town_root: &Path, event: &FeedEvent<'_>) -> anyhow::Result<()> {
    let path = feed_path(town_root);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut line = serde_json::to_string(event)?;
    line.push('\n');

    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?
        .write_all(line.as_bytes())?;
    Ok(())
}

/// Payload for an enqueue event.
pub fn enqueue_payload(bead_id: &str, rig: &str) -> Value {
    serde_json::json!({ "bead": bead_id, "rig": rig })
}

/// Payload for a successful dispatch event.
pub fn dispatch_payload(bead_id: &str, rig: &str, polecat: &str) -> Value {
    serde_json::json!({ "bead": bead_id, "rig": rig, "polecat": polecat })
}

/// Payload for a dispatch failure event.
pub fn dispatch_failed_payload(bead_id: &str, rig: &str, error: &str) -> Value {
    serde_json::json!({ "bead": bead_id, "rig": rig, "error": error })
}
