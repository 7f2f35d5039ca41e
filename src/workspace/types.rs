// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace records and requests.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::outcome::BestEffort;

/// Lifecycle state of a workspace.
///
/// Transitions only move forward: `active -> {stale | merged} -> destroyed`,
/// plus `active -> destroyed` when the directory vanished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Stale,
    Merged,
    Destroyed,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Merged => "merged",
            Self::Destroyed => "destroyed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Stale | Self::Merged => 1,
            Self::Destroyed => 2,
        }
    }

    /// Whether a record may move from `self` to `next`.
    pub fn can_transition_to(&self, next: WorkspaceStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Statuses a record may be in before moving to `self`.
    pub fn predecessors(&self) -> Vec<WorkspaceStatus> {
        ALL_STATUSES
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(*self))
            .collect()
    }

    /// Counts against the per-codebase limit.
    pub fn is_live(&self) -> bool {
        *self != Self::Destroyed
    }
}

const ALL_STATUSES: [WorkspaceStatus; 4] = [
    WorkspaceStatus::Active,
    WorkspaceStatus::Stale,
    WorkspaceStatus::Merged,
    WorkspaceStatus::Destroyed,
];

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown workspace status: {s}"))
    }
}

/// What kind of conversation a workspace serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Issue,
    Pr,
    Review,
    Thread,
    Task,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Pr => "pr",
            Self::Review => "review",
            Self::Thread => "thread",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(Self::Issue),
            "pr" => Ok(Self::Pr),
            "review" => Ok(Self::Review),
            "thread" => Ok(Self::Thread),
            "task" => Ok(Self::Task),
            other => Err(format!("unknown workflow type: {other}")),
        }
    }
}

/// A branch-backed working directory cut from a canonical repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// Filesystem path as a string; the natural key.
    pub id: String,
    pub path: PathBuf,
    pub branch_name: String,
    pub codebase_id: String,
    pub conversation_id: String,
    pub status: WorkspaceStatus,
    pub workflow_type: WorkflowType,
    pub workflow_id: String,
    /// Commit the branch was cut from, used for merge detection.
    pub base_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Everything needed to allocate a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRequest {
    pub codebase_id: String,
    pub conversation_id: String,
    pub workflow_type: WorkflowType,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_sha: Option<String>,
}

impl WorkspaceRequest {
    pub fn new(
        codebase_id: impl Into<String>,
        conversation_id: impl Into<String>,
        workflow_type: WorkflowType,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self {
            codebase_id: codebase_id.into(),
            conversation_id: conversation_id.into(),
            workflow_type,
            workflow_id: workflow_id.into(),
            pr_number: None,
            pr_sha: None,
        }
    }

    pub fn with_pr(mut self, number: u64, sha: Option<String>) -> Self {
        self.pr_number = Some(number);
        self.pr_sha = sha;
        self
    }

    /// Deterministic branch name for this request.
    pub fn branch_name(&self) -> String {
        match self.workflow_type {
            WorkflowType::Thread => format!("thread-{}", short_hash(&self.workflow_id)),
            WorkflowType::Task => {
                let slug = slugify(&self.workflow_id);
                if slug.is_empty() {
                    format!("task-{}", short_hash(&self.workflow_id))
                } else {
                    format!("task-{slug}")
                }
            }
            kind => format!("{}-{}", kind.as_str(), slugify(&self.workflow_id)),
        }
    }
}

/// Options for [`super::WorkspaceProvider::destroy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyOptions {
    pub force: bool,
    /// Delete this branch afterwards (best effort).
    pub branch_name: Option<String>,
}

impl DestroyOptions {
    pub fn forced(branch_name: impl Into<String>) -> Self {
        Self {
            force: true,
            branch_name: Some(branch_name.into()),
        }
    }
}

/// What a destroy call actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyReport {
    /// `false` when git reported the worktree as already gone.
    pub worktree_removed: bool,
    /// A directory remainder had to be deleted by hand.
    pub remainder_purged: bool,
    /// A git failure that was tolerated because the directory was purged.
    pub git_error: Option<String>,
    pub branch: BestEffort,
}

/// Result of copying auxiliary files into a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Destination paths written.
    pub copied: Vec<PathBuf>,
    /// Entries whose source does not exist in the repository.
    pub missing: Vec<String>,
    /// Entries that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl CopyReport {
    pub fn outcome(&self) -> BestEffort {
        if !self.failed.is_empty() {
            let reasons: Vec<String> = self
                .failed
                .iter()
                .map(|(entry, reason)| format!("{entry}: {reason}"))
                .collect();
            BestEffort::Failed(reasons.join("; "))
        } else if self.copied.is_empty() {
            BestEffort::skipped("nothing to copy")
        } else {
            BestEffort::Done
        }
    }
}

/// Lowercase `[a-z0-9-]` form of an identifier, at most 48 characters.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed: String = slug.trim_matches('-').chars().take(48).collect();
    trimmed.trim_end_matches('-').to_string()
}

/// First 8 hex characters of the SHA-256 of `input`.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_only_move_forward() {
        use WorkspaceStatus::*;
        assert!(Active.can_transition_to(Stale));
        assert!(Active.can_transition_to(Merged));
        assert!(Active.can_transition_to(Destroyed));
        assert!(Stale.can_transition_to(Destroyed));
        assert!(!Stale.can_transition_to(Merged));
        assert!(!Merged.can_transition_to(Stale));
        assert!(!Destroyed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));

        assert_eq!(Destroyed.predecessors(), vec![Active, Stale, Merged]);
        assert_eq!(Stale.predecessors(), vec![Active]);
        assert!(Active.predecessors().is_empty());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("merged".parse::<WorkspaceStatus>().unwrap(), WorkspaceStatus::Merged);
        assert!("gone".parse::<WorkspaceStatus>().is_err());
        assert!(!WorkspaceStatus::Destroyed.is_live());
    }

    #[test]
    fn test_branch_names() {
        let issue = WorkspaceRequest::new("api", "c1", WorkflowType::Issue, "42");
        assert_eq!(issue.branch_name(), "issue-42");

        let pr = WorkspaceRequest::new("api", "c1", WorkflowType::Pr, "17").with_pr(17, None);
        assert_eq!(pr.branch_name(), "pr-17");

        let thread = WorkspaceRequest::new("api", "c1", WorkflowType::Thread, "slack:C01/1712.55");
        let name = thread.branch_name();
        assert!(name.starts_with("thread-"));
        assert_eq!(name.len(), "thread-".len() + 8);

        let task = WorkspaceRequest::new("api", "c1", WorkflowType::Task, "Fix the Login Bug!");
        assert_eq!(task.branch_name(), "task-fix-the-login-bug");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("../../etc/passwd"), "etc-passwd");
        assert_eq!(slugify("--"), "");
        assert_eq!(slugify(&"a".repeat(100)).len(), 48);
    }

    #[test]
    fn test_short_hash_is_stable() {
        assert_eq!(short_hash("abc"), "ba7816bf");
    }

    #[test]
    fn test_copy_report_outcome() {
        assert!(matches!(CopyReport::default().outcome(), BestEffort::Skipped(_)));
        let failed = CopyReport {
            failed: vec![(".env".to_string(), "denied".to_string())],
            ..Default::default()
        };
        assert_eq!(failed.outcome(), BestEffort::Failed(".env: denied".to_string()));
    }
}
