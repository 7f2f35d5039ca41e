// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Isolated workspaces.
//!
//! Every task runs in its own git worktree, cut from a canonical repository on
//! a branch named after the conversation. The provider only creates and
//! destroys; it never looks at limits. Capacity decisions belong to the
//! eviction scheduler.
//!
//! # Directory Structure
//!
//! ```text
//! <worktree_base>/
//! └── <codebase_id>/
//!     ├── issue-42/        # git worktree on branch issue-42
//!     │   ├── .git         # "gitdir: <repo>/.git/worktrees/issue-42"
//!     │   └── ...
//!     └── thread-1a2b3c4d/
//! ```

pub mod aux_files;
pub mod git;
mod types;
mod worktree;

pub use git::{classify_stderr, GitCli, Vcs};
pub use types::{
    short_hash, slugify, CopyReport, DestroyOptions, DestroyReport, WorkflowType, Workspace,
    WorkspaceRequest, WorkspaceStatus,
};
pub use worktree::{is_valid_worktree, WorktreeProvider};

use async_trait::async_trait;

use crate::error::WorkspaceError;
use crate::outcome::BestEffort;

/// Creates and destroys isolated workspaces.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Allocate a workspace for `request`.
    ///
    /// An orphaned directory at the target path is deleted first. A valid
    /// worktree already at the target path is adopted. A branch-name collision
    /// deletes the stale branch and retries once.
    async fn create(&self, request: &WorkspaceRequest) -> Result<Workspace, WorkspaceError>;

    /// Remove a workspace directory and its worktree registration.
    ///
    /// "Already gone" is success. Any directory remainder is purged afterwards.
    /// Branch deletion is best effort.
    async fn destroy(
        &self,
        codebase_id: &str,
        workspace_id: &str,
        options: DestroyOptions,
    ) -> Result<DestroyReport, WorkspaceError>;

    /// Copy untracked auxiliary files from the canonical repository.
    async fn copy_auxiliary_files(&self, workspace: &Workspace) -> CopyReport;

    /// Whether the workspace branch has landed on the default branch.
    async fn is_merged(&self, workspace: &Workspace) -> Result<bool, WorkspaceError>;

    async fn has_uncommitted_changes(&self, workspace: &Workspace) -> Result<bool, WorkspaceError>;

    /// Clean up git bookkeeping for a workspace whose directory is already gone.
    async fn forget(&self, workspace: &Workspace) -> BestEffort;
}
