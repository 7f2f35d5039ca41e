// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace classification for eviction.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::workspace::Workspace;

/// Eviction verdict for one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Active,
    Stale,
    Merged,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Merged => "merged",
        };
        f.write_str(s)
    }
}

/// A workspace joined with the signals a sweep decides on.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub workspace: Workspace,
    pub directory_exists: bool,
    pub branch_merged: bool,
    /// Time since the most recent activity.
    pub idle_for: Duration,
}

impl EvictionCandidate {
    pub fn new(workspace: Workspace, branch_merged: bool, now: DateTime<Utc>) -> Self {
        let directory_exists = workspace.path.is_dir();
        let idle_for = now - last_activity(&workspace);
        Self {
            workspace,
            directory_exists,
            branch_merged,
            idle_for,
        }
    }
}

/// Latest of the recorded activity time and the directory's modification time.
pub fn last_activity(workspace: &Workspace) -> DateTime<Utc> {
    match directory_mtime(&workspace.path) {
        Some(mtime) if mtime > workspace.last_activity_at => mtime,
        _ => workspace.last_activity_at,
    }
}

fn directory_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Merged wins over stale. Idle for at least `stale_threshold` is stale.
pub fn classify(candidate: &EvictionCandidate, stale_threshold: Duration) -> Classification {
    if candidate.branch_merged {
        Classification::Merged
    } else if candidate.idle_for >= stale_threshold {
        Classification::Stale
    } else {
        Classification::Active
    }
}
