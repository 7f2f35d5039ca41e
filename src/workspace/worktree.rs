// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree workspace provider.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{counters, GLOBAL_METRICS};

use crate::config::{load_repo_config, CodebaseConfig, ResolvedConfig};
use crate::error::{GitError, WorkspaceError};
use crate::outcome::BestEffort;

use super::aux_files;
use super::git::Vcs;
use super::types::{
    slugify, CopyReport, DestroyOptions, DestroyReport, Workspace, WorkspaceRequest,
    WorkspaceStatus,
};
use super::WorkspaceProvider;

/// Whether `path` is a linked git worktree whose admin directory still exists.
///
/// A directory with no `.git` file, a `.git` directory (a full clone), or a
/// `gitdir:` pointer to a pruned admin directory is an orphan.
pub fn is_valid_worktree(path: &Path) -> bool {
    let dot_git = path.join(".git");
    if !dot_git.is_file() {
        return false;
    }
    let Ok(content) = std::fs::read_to_string(&dot_git) else {
        return false;
    };
    match content.trim().strip_prefix("gitdir:") {
        Some(gitdir) => {
            let gitdir = Path::new(gitdir.trim());
            let gitdir = if gitdir.is_absolute() {
                gitdir.to_path_buf()
            } else {
                path.join(gitdir)
            };
            gitdir.is_dir()
        }
        None => false,
    }
}

/// Creates workspaces as `git worktree`s under a common base directory.
pub struct WorktreeProvider {
    vcs: Arc<dyn Vcs>,
    worktree_base: PathBuf,
    codebases: HashMap<String, CodebaseConfig>,
    /// Auxiliary entries from configuration, on top of the defaults.
    copy_files: Vec<String>,
}

impl WorktreeProvider {
    pub fn new(
        vcs: Arc<dyn Vcs>,
        worktree_base: impl Into<PathBuf>,
        codebases: impl IntoIterator<Item = CodebaseConfig>,
    ) -> Self {
        Self {
            vcs,
            worktree_base: worktree_base.into(),
            codebases: codebases.into_iter().map(|c| (c.id.clone(), c)).collect(),
            copy_files: Vec::new(),
        }
    }

    pub fn from_config(vcs: Arc<dyn Vcs>, config: &ResolvedConfig) -> Self {
        Self::new(vcs, config.worktree_base.clone(), config.codebases.clone())
            .with_copy_files(config.copy_files.clone())
    }

    pub fn with_copy_files(mut self, copy_files: Vec<String>) -> Self {
        self.copy_files = copy_files;
        self
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    fn codebase(&self, id: &str) -> Result<&CodebaseConfig, WorkspaceError> {
        self.codebases
            .get(id)
            .ok_or_else(|| WorkspaceError::UnknownCodebase(id.to_string()))
    }

    /// Deterministic target path for a branch of a codebase.
    pub fn worktree_path(&self, codebase_id: &str, branch: &str) -> PathBuf {
        self.worktree_base.join(slugify(codebase_id)).join(branch)
    }

    /// Reject ids that do not point strictly inside the worktree base.
    fn checked_path(&self, workspace_id: &str) -> Result<PathBuf, WorkspaceError> {
        let path = PathBuf::from(workspace_id);
        let escapes = path.components().any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.worktree_base) || path == self.worktree_base {
            return Err(WorkspaceError::InvalidRequest(format!(
                "{workspace_id} is not inside {}",
                self.worktree_base.display()
            )));
        }
        Ok(path)
    }

    fn build_workspace(
        &self,
        request: &WorkspaceRequest,
        path: PathBuf,
        branch: String,
        base_commit: Option<String>,
    ) -> Workspace {
        let now = Utc::now();
        Workspace {
            id: path.to_string_lossy().to_string(),
            path,
            branch_name: branch,
            codebase_id: request.codebase_id.clone(),
            conversation_id: request.conversation_id.clone(),
            status: WorkspaceStatus::Active,
            workflow_type: request.workflow_type,
            workflow_id: request.workflow_id.clone(),
            base_commit,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Add the worktree, deleting a stale branch and retrying once on collision.
    async fn add_with_retry(
        &self,
        repo: &Path,
        target: &Path,
        branch: &str,
        base_ref: Option<&str>,
    ) -> Result<(), WorkspaceError> {
        match self.vcs.add_worktree(repo, target, branch, base_ref).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                info!(branch, "Branch already exists, deleting stale branch and retrying");
                if let Err(delete_err) = self.vcs.delete_branch(repo, branch, true).await {
                    return Err(WorkspaceError::BranchCollision {
                        branch: branch.to_string(),
                        source: delete_err,
                    });
                }
                self.vcs
                    .add_worktree(repo, target, branch, base_ref)
                    .await
                    .map_err(|source| WorkspaceError::BranchCollision {
                        branch: branch.to_string(),
                        source,
                    })
            }
            Err(e) => Err(WorkspaceError::Git(e)),
        }
    }

    async fn delete_branch_best_effort(&self, repo: &Path, branch: &str) -> BestEffort {
        let result = self.vcs.delete_branch(repo, branch, true).await;
        BestEffort::from_result("delete branch", result)
    }
}

#[async_trait]
impl WorkspaceProvider for WorktreeProvider {
    #[instrument(skip(self, request), fields(codebase = %request.codebase_id, workflow = %request.workflow_id))]
    async fn create(&self, request: &WorkspaceRequest) -> Result<Workspace, WorkspaceError> {
        let start = Instant::now();
        let codebase = self.codebase(&request.codebase_id)?;
        if request.workflow_id.trim().is_empty() {
            return Err(WorkspaceError::InvalidRequest("workflow id is empty".to_string()));
        }

        let branch = request.branch_name();
        let target = self.worktree_path(&request.codebase_id, &branch);

        if target.exists() {
            if is_valid_worktree(&target) {
                info!(path = %target.display(), "Adopting existing worktree");
                let base_commit = self.vcs.rev_parse(&target, "HEAD").await.ok();
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.incr(counters::WORKSPACE_ADOPTED);
                return Ok(self.build_workspace(request, target, branch, base_commit));
            }

            warn!(path = %target.display(), "Removing orphaned directory before creating worktree");
            std::fs::remove_dir_all(&target).map_err(|e| WorkspaceError::io(&target, e))?;
            // Drop any registration git still holds for the old path.
            let _ = BestEffort::from_result("prune worktrees", self.vcs.prune_worktrees(&codebase.repo_path).await);
            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.incr(counters::WORKSPACE_ORPHAN_REPAIRED);
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
        }

        let base_ref = match request.pr_number {
            Some(number) => {
                let refspec = format!("pull/{number}/head");
                self.vcs
                    .fetch_ref(&codebase.repo_path, "origin", &refspec)
                    .await?;
                Some(request.pr_sha.clone().unwrap_or_else(|| "FETCH_HEAD".to_string()))
            }
            None => Some(codebase.default_branch.clone()),
        };

        self.add_with_retry(&codebase.repo_path, &target, &branch, base_ref.as_deref())
            .await?;

        let base_commit = match self.vcs.rev_parse(&target, "HEAD").await {
            Ok(sha) => Some(sha),
            Err(e) => {
                warn!(error = %e, "Could not record base commit");
                None
            }
        };

        info!(path = %target.display(), branch = %branch, "Created workspace");
        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.incr(counters::WORKSPACE_CREATED);
            GLOBAL_METRICS.record_operation("workspace.create", start.elapsed());
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        Ok(self.build_workspace(request, target, branch, base_commit))
    }

    #[instrument(skip(self, options), fields(force = options.force))]
    async fn destroy(
        &self,
        codebase_id: &str,
        workspace_id: &str,
        options: DestroyOptions,
    ) -> Result<DestroyReport, WorkspaceError> {
        let start = Instant::now();
        let codebase = self.codebase(codebase_id)?;
        let path = self.checked_path(workspace_id)?;
        let repo = &codebase.repo_path;

        let (worktree_removed, git_error) =
            match self.vcs.remove_worktree(repo, &path, options.force).await {
                Ok(()) => (true, None),
                Err(e) if e.is_already_gone() => {
                    info!(path = %path.display(), "Worktree already removed");
                    (false, None)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "git worktree remove failed, purging directory");
                    (false, Some(e.to_string()))
                }
            };

        let remainder_purged = if path.exists() {
            debug!(path = %path.display(), "Purging workspace remainder");
            std::fs::remove_dir_all(&path).map_err(|e| WorkspaceError::io(&path, e))?;
            true
        } else {
            false
        };

        if path.exists() {
            return Err(WorkspaceError::RemainderPersisted(path));
        }

        if remainder_purged || git_error.is_some() {
            let _ = BestEffort::from_result("prune worktrees", self.vcs.prune_worktrees(repo).await);
        }

        let branch = match &options.branch_name {
            Some(name) => self.delete_branch_best_effort(repo, name).await,
            None => BestEffort::skipped("no branch requested"),
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("workspace.destroy", start.elapsed());
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        Ok(DestroyReport {
            worktree_removed,
            remainder_purged,
            git_error,
            branch,
        })
    }

    async fn copy_auxiliary_files(&self, workspace: &Workspace) -> CopyReport {
        let codebase = match self.codebase(&workspace.codebase_id) {
            Ok(codebase) => codebase,
            Err(e) => {
                return CopyReport {
                    failed: vec![("*".to_string(), e.to_string())],
                    ..Default::default()
                }
            }
        };

        let mut entries = self.copy_files.clone();
        match load_repo_config(&codebase.repo_path) {
            Ok(Some(repo_config)) => entries.extend(repo_config.copy_files().iter().cloned()),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable repository config"),
        }

        let repo = codebase.repo_path.clone();
        let dest = workspace.path.clone();
        let report = tokio::task::spawn_blocking(move || {
            aux_files::copy_auxiliary_files(&repo, &dest, &entries)
        })
        .await
        .unwrap_or_else(|e| CopyReport {
            failed: vec![("*".to_string(), e.to_string())],
            ..Default::default()
        });

        debug!(
            workspace = %workspace.id,
            copied = report.copied.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Copied auxiliary files"
        );
        report
    }

    async fn is_merged(&self, workspace: &Workspace) -> Result<bool, WorkspaceError> {
        let codebase = self.codebase(&workspace.codebase_id)?;
        let Some(base) = workspace.base_commit.as_deref() else {
            return Ok(false);
        };

        let branch_ref = format!("refs/heads/{}", workspace.branch_name);
        let tip = match self.vcs.rev_parse(&codebase.repo_path, &branch_ref).await {
            Ok(tip) => tip,
            Err(GitError::Failed { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if tip == base {
            return Ok(false);
        }

        Ok(self
            .vcs
            .is_ancestor(&codebase.repo_path, &tip, &codebase.default_branch)
            .await?)
    }

    async fn has_uncommitted_changes(&self, workspace: &Workspace) -> Result<bool, WorkspaceError> {
        Ok(self.vcs.has_uncommitted_changes(&workspace.path).await?)
    }

    async fn forget(&self, workspace: &Workspace) -> BestEffort {
        let codebase = match self.codebase(&workspace.codebase_id) {
            Ok(codebase) => codebase,
            Err(e) => return BestEffort::Failed(e.to_string()),
        };
        let pruned = BestEffort::from_result(
            "prune worktrees",
            self.vcs.prune_worktrees(&codebase.repo_path).await,
        );
        let branch = self
            .delete_branch_best_effort(&codebase.repo_path, &workspace.branch_name)
            .await;
        if pruned.is_failed() {
            pruned
        } else {
            branch
        }
    }
}
