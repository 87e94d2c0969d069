//! Convoy interface used by the queue.
//!
//! Convoys themselves (tracking containers grouping related beads) live in
//! the town bead store as `gt:convoy`-labeled beads with `tracks` dependency
//! edges to their members. The queue only needs four operations: create an
//! auto-convoy at enqueue, look up existing tracking, enumerate tracked
//! issues for `gt convoy queue`, and count open convoys for the idle census.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::beads::{self, DepChild};
use crate::subprocess::Tool;

/// Label identifying convoy beads in the town store.
pub const LABEL_CONVOY: &str = "gt:convoy";

#[derive(Debug, Deserialize)]
struct CreatedBead {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListedBead {
    #[serde(default)]
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    status: String,
}

/// A convoy member with enough detail to decide queueability.
#[derive(Debug, Clone)]
pub struct TrackedIssue {
    pub id: String,
    pub title: String,
    pub status: String,
    pub assignee: String,
    pub labels: Vec<String>,
}

/// Create an auto-convoy tracking a single bead. Returns the convoy id.
pub fn create_auto_convoy(
    town_root: &Path,
    bead_id: &str,
    bead_title: &str,
    owned: bool,
) -> anyhow::Result<String> {
    let dir = town_root.to_path_buf();
    let title = format!("Convoy: {bead_title}");

    let mut create = Tool::new("bd")
        .arg("create")
        .arg(&title)
        .arg(&format!("--add-label={LABEL_CONVOY}"))
        .arg("--json")
        .current_dir(&dir);
    if owned {
        create = create.arg("--add-label=gt:convoy-owned");
    }
    let output = create.run_ok().context("bd create convoy")?;
    let created: CreatedBead = output.parse_json().context("parsing bd create output")?;

    Tool::new("bd")
        .args(&["dep", "add", &created.id, bead_id, "--type=tracks"])
        .current_dir(&dir)
        .run_ok()
        .with_context(|| format!("tracking {bead_id} in convoy {}", created.id))?;

    Ok(created.id)
}

/// Returns the id of the convoy already tracking a bead, or None.
pub fn tracking_convoy(town_root: &Path, bead_id: &str) -> Option<String> {
    let output = Tool::new("bd")
        .args(&[
            "dep",
            "list",
            bead_id,
            "--direction=up",
            "--type=tracks",
            "--json",
        ])
        .current_dir(town_root)
        .run()
        .ok()?;
    if !output.success() {
        return None;
    }
    let parents: Vec<DepChild> = output.parse_json().ok()?;
    parents.into_iter().map(|p| p.id).next()
}

/// Enumerate the issues a convoy tracks, enriched with status/labels for
/// queueability checks. Issues whose detail lookup fails are returned with
/// the dep-provided fields only.
pub fn tracked_issues(town_root: &Path, convoy_id: &str) -> anyhow::Result<Vec<TrackedIssue>> {
    let children = beads::dep_children(town_root, convoy_id, "tracks")
        .with_context(|| format!("listing issues tracked by {convoy_id}"))?;

    let mut issues = Vec::with_capacity(children.len());
    for child in children {
        match beads::get_bead_info(town_root, &child.id) {
            Ok(info) => issues.push(TrackedIssue {
                id: info.id,
                title: info.title,
                status: info.status,
                assignee: info.assignee,
                labels: info.labels,
            }),
            Err(_) => issues.push(TrackedIssue {
                id: child.id,
                title: child.title,
                status: child.status,
                assignee: String::new(),
                labels: Vec::new(),
            }),
        }
    }
    Ok(issues)
}

/// Count open convoys for the idle census. Errors count as zero; the idle
/// path must never fail the heartbeat.
pub fn count_open_convoys(town_root: &Path) -> u32 {
    let output = match Tool::new("bd")
        .args(&["list", "--label", LABEL_CONVOY, "--json", "--limit=0"])
        .current_dir(town_root)
        .run()
    {
        Ok(out) if out.success() => out,
        _ => return 0,
    };

    let convoys: Vec<ListedBead> = match output.parse_json() {
        Ok(c) => c,
        Err(_) => return 0,
    };

    convoys
        .iter()
        .filter(|c| c.status == "open" || c.status.is_empty())
        .count() as u32
}
