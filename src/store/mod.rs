// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable storage for workspaces and workflow runs.
//!
//! Every operation is a single-row (or single-statement) atomic change. Two
//! invariants are enforced by the store itself rather than by callers:
//!
//! - at most one `running` run per conversation (a partial unique index), and
//! - workspace and run statuses only move forward (conditional updates).

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::workflow::{NewRunEvent, NewWorkflowRun, RunEvent, RunStatus, WorkflowRun};
use crate::workspace::{WorkflowType, Workspace, WorkspaceStatus};

/// Persistence gateway.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- workflow runs ----

    /// The `running` run of a conversation, if any.
    async fn get_active_run(&self, conversation_id: &str) -> Result<Option<WorkflowRun>, StoreError>;

    /// Insert a run in `running` state at step 0.
    ///
    /// Fails with [`StoreError::Conflict`] if the conversation already has one.
    async fn create_run(&self, run: NewWorkflowRun) -> Result<WorkflowRun, StoreError>;

    /// Move a `running` run to a terminal status.
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<WorkflowRun, StoreError>;

    /// Record progress of a `running` run and bump its activity time.
    async fn update_run_step(&self, run_id: &str, step_index: usize) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError>;

    /// Most recent runs first, optionally for one conversation.
    async fn list_runs(
        &self,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError>;

    async fn list_running_runs(&self) -> Result<Vec<WorkflowRun>, StoreError>;

    async fn append_run_event(&self, event: NewRunEvent) -> Result<RunEvent, StoreError>;

    async fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>, StoreError>;

    // ---- workspaces ----

    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, StoreError>;

    /// The live (not destroyed) workspace serving a workflow, if any.
    async fn find_workspace(
        &self,
        codebase_id: &str,
        workflow_type: WorkflowType,
        workflow_id: &str,
    ) -> Result<Option<Workspace>, StoreError>;

    /// Insert a workspace. A destroyed record at the same path is replaced;
    /// a live one is a [`StoreError::Conflict`].
    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), StoreError>;

    /// Forward-only status change; anything else is [`StoreError::InvalidTransition`].
    async fn update_workspace_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
    ) -> Result<(), StoreError>;

    /// Bump `last_activity_at` to now.
    async fn touch_workspace(&self, workspace_id: &str) -> Result<(), StoreError>;

    /// Workspaces of a codebase that count against its limit.
    async fn count_active_workspaces(&self, codebase_id: &str) -> Result<usize, StoreError>;

    /// Live workspaces, oldest activity first.
    async fn list_active_workspaces(
        &self,
        codebase_id: Option<&str>,
    ) -> Result<Vec<Workspace>, StoreError>;
}
