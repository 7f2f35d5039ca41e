// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Version-control subprocess calls.
//!
//! [`Vcs`] is the seam between workspace management and git. [`GitCli`] runs
//! the real `git` binary with a hard timeout on every call and classifies
//! stderr into a [`GitFailureKind`] so callers can treat "already exists" and
//! "already removed" as ordinary outcomes.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::error::{GitError, GitFailureKind};

/// Ordered stderr patterns. First match wins; input is lowercased.
const STDERR_PATTERNS: &[(&str, GitFailureKind)] = &[
    ("already exists", GitFailureKind::AlreadyExists),
    ("is not a working tree", GitFailureKind::NotAWorktree),
    ("no such file or directory", GitFailureKind::PathMissing),
    ("checked out at", GitFailureKind::BranchCheckedOut),
    ("used by worktree at", GitFailureKind::BranchCheckedOut),
];

/// Classify a git stderr message.
pub fn classify_stderr(stderr: &str) -> GitFailureKind {
    let normalized = stderr.to_lowercase();
    STDERR_PATTERNS
        .iter()
        .find(|(pattern, _)| normalized.contains(pattern))
        .map(|(_, kind)| *kind)
        .unwrap_or(GitFailureKind::Other)
}

/// Git operations needed to manage workspaces.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// `git worktree add -b <branch> <target> [base_ref]`
    async fn add_worktree(
        &self,
        repo: &Path,
        target: &Path,
        branch: &str,
        base_ref: Option<&str>,
    ) -> Result<(), GitError>;

    /// `git worktree remove [--force] <target>`
    async fn remove_worktree(&self, repo: &Path, target: &Path, force: bool) -> Result<(), GitError>;

    /// `git branch -d|-D <branch>`
    async fn delete_branch(&self, repo: &Path, branch: &str, force: bool) -> Result<(), GitError>;

    /// `git worktree prune`
    async fn prune_worktrees(&self, repo: &Path) -> Result<(), GitError>;

    /// `git fetch <remote> <refspec>`; the result is left in `FETCH_HEAD`.
    async fn fetch_ref(&self, repo: &Path, remote: &str, refspec: &str) -> Result<(), GitError>;

    /// Resolve a revision to a full commit id.
    async fn rev_parse(&self, dir: &Path, rev: &str) -> Result<String, GitError>;

    /// Whether `ancestor` is reachable from `descendant`.
    async fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool, GitError>;

    /// Whether the working tree at `dir` has staged, unstaged or untracked changes.
    async fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool, GitError>;
}

/// [`Vcs`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `git -C <dir> <args>` and return the raw output.
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<Output, GitError> {
        let command = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        trace!(dir = %dir.display(), ?args, "git");
        let start = Instant::now();

        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(dir)
            .args(args)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(GitError::Spawn(e.to_string())),
            Err(_) => {
                return Err(GitError::Timeout {
                    command,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation(&format!("git.{}", command.replace(' ', "_")), start.elapsed());
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        Ok(output)
    }

    /// Run a git command that must succeed; returns trimmed stdout.
    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(dir, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(failure(args, &output))
        }
    }
}

fn failure(args: &[&str], output: &Output) -> GitError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let kind = classify_stderr(&stderr);
    debug!(?args, %kind, %stderr, "git command failed");
    GitError::Failed {
        command: args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
        kind,
        stderr,
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn add_worktree(
        &self,
        repo: &Path,
        target: &Path,
        branch: &str,
        base_ref: Option<&str>,
    ) -> Result<(), GitError> {
        let target = target.to_string_lossy();
        let mut args = vec!["worktree", "add", "-b", branch, &*target];
        if let Some(base) = base_ref {
            args.push(base);
        }
        self.git(repo, &args).await.map(|_| ())
    }

    async fn remove_worktree(&self, repo: &Path, target: &Path, force: bool) -> Result<(), GitError> {
        let target = target.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&*target);
        self.git(repo, &args).await.map(|_| ())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.git(repo, &["branch", flag, branch]).await.map(|_| ())
    }

    async fn prune_worktrees(&self, repo: &Path) -> Result<(), GitError> {
        self.git(repo, &["worktree", "prune"]).await.map(|_| ())
    }

    async fn fetch_ref(&self, repo: &Path, remote: &str, refspec: &str) -> Result<(), GitError> {
        self.git(repo, &["fetch", remote, refspec]).await.map(|_| ())
    }

    async fn rev_parse(&self, dir: &Path, rev: &str) -> Result<String, GitError> {
        self.git(dir, &["rev-parse", "--verify", "--quiet", rev]).await
    }

    async fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let args = ["merge-base", "--is-ancestor", ancestor, descendant];
        let output = self.run(repo, &args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(failure(&args, &output)),
        }
    }

    async fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool, GitError> {
        let status = self.git(dir, &["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stderr_table() {
        assert_eq!(
            classify_stderr("fatal: a branch named 'issue-42' already exists"),
            GitFailureKind::AlreadyExists
        );
        assert_eq!(
            classify_stderr("fatal: '/wt/issue-42' is not a working tree"),
            GitFailureKind::NotAWorktree
        );
        assert_eq!(
            classify_stderr("fatal: cannot change to '/wt/x': No such file or directory"),
            GitFailureKind::PathMissing
        );
        assert_eq!(
            classify_stderr("error: Cannot delete branch 'pr-1' checked out at '/wt/pr-1'"),
            GitFailureKind::BranchCheckedOut
        );
        assert_eq!(classify_stderr("fatal: bad object"), GitFailureKind::Other);
    }

    #[test]
    fn test_first_pattern_wins() {
        // Mentions both; "already exists" is listed first.
        assert_eq!(
            classify_stderr("'x' already exists: No such file or directory"),
            GitFailureKind::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_git_cli_reports_failures_without_hanging() {
        let temp = tempfile::TempDir::new().unwrap();
        let git = GitCli::new(Duration::from_secs(10));
        // Not a repository: either git is missing (spawn error) or it fails.
        let result = git.rev_parse(temp.path(), "HEAD").await;
        assert!(result.is_err());
    }
}
