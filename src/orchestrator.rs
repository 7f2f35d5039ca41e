// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task orchestration.
//!
//! One inbound task runs entirely under its conversation's lock:
//!
//! ```text
//! lock(conversation)
//!   ├── reuse the live workspace for (codebase, workflow), or
//!   │   reserve_capacity(codebase) ──(full)──> notify "limit reached", stop
//!   │   create + copy auxiliary files + persist
//!   │   release the codebase gate
//!   └── coordinator.start(steps)
//! unlock
//! ```
//!
//! The locked section runs in a spawned task that owns the guard, so an
//! abandoned caller cannot release the lock early. Inside it the task body is
//! spawned once more so a panic surfaces as a `JoinError` while the lock is
//! still held. The conversation's `running` run, if any, is then failed before
//! the next queued task gets in.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, instrument, warn, Instrument};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{counters, GLOBAL_METRICS};

use crate::config::ResolvedConfig;
use crate::error::{OrchestratorError, StoreError};
use crate::eviction::{CapacityDecision, EvictionScheduler};
use crate::lock::ConversationLock;
use crate::store::{SqliteStore, Store};
use crate::telemetry::CorrelationId;
use crate::types::SharedClient;
use crate::workflow::{
    deliver, Notifier, RunContext, RunOutcome, WorkflowDefinition, WorkflowRunCoordinator,
};
use crate::workspace::{
    DestroyReport, GitCli, WorkflowType, Workspace, WorkspaceProvider, WorkspaceRequest,
    WorkspaceStatus, WorktreeProvider,
};

/// One unit of inbound work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub conversation_id: String,
    pub codebase_id: String,
    pub workflow_type: WorkflowType,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_sha: Option<String>,
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub message: String,
}

impl TaskRequest {
    fn workspace_request(&self) -> WorkspaceRequest {
        let request = WorkspaceRequest::new(
            self.codebase_id.clone(),
            self.conversation_id.clone(),
            self.workflow_type,
            self.workflow_id.clone(),
        );
        match self.pr_number {
            Some(number) => request.with_pr(number, self.pr_sha.clone()),
            None => request,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// A workspace was resolved and the workflow was started.
    Ran {
        workspace: Workspace,
        outcome: RunOutcome,
    },
    /// The codebase is at its workspace limit even after a sweep.
    CapacityExhausted(CapacityDecision),
}

enum Resolution {
    Ready(Workspace),
    Blocked(CapacityDecision),
}

/// Wires the lock, eviction, workspaces and the run coordinator together.
pub struct TaskOrchestrator {
    store: Arc<dyn Store>,
    provider: Arc<dyn WorkspaceProvider>,
    eviction: Arc<EvictionScheduler>,
    coordinator: Arc<WorkflowRunCoordinator>,
    notifier: Arc<dyn Notifier>,
    lock: ConversationLock,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn WorkspaceProvider>,
        eviction: Arc<EvictionScheduler>,
        coordinator: Arc<WorkflowRunCoordinator>,
        notifier: Arc<dyn Notifier>,
        lock: ConversationLock,
    ) -> Self {
        Self {
            store,
            provider,
            eviction,
            coordinator,
            notifier,
            lock,
        }
    }

    /// Build the full stack on the git CLI and a SQLite database.
    pub fn from_config(
        config: &ResolvedConfig,
        client: SharedClient,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_at(&config.database_path)?);
        let vcs = Arc::new(GitCli::new(config.git_timeout()));
        let provider: Arc<dyn WorkspaceProvider> =
            Arc::new(WorktreeProvider::from_config(vcs, config));
        let lock = ConversationLock::new();
        let eviction = Arc::new(EvictionScheduler::from_config(
            store.clone(),
            provider.clone(),
            lock.clone(),
            config,
        ));
        let coordinator = Arc::new(
            WorkflowRunCoordinator::from_config(store.clone(), client, notifier.clone(), config)
                .with_lock(lock.clone()),
        );
        Ok(Self::new(store, provider, eviction, coordinator, notifier, lock))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn eviction(&self) -> &Arc<EvictionScheduler> {
        &self.eviction
    }

    pub fn coordinator(&self) -> &Arc<WorkflowRunCoordinator> {
        &self.coordinator
    }

    pub fn lock(&self) -> &ConversationLock {
        &self.lock
    }

    /// Process one task under its conversation lock.
    ///
    /// The lock is taken and held inside a spawned task, so dropping the
    /// returned future does not release it: the task still finishes under
    /// the lock and its result is discarded.
    pub async fn handle_task(
        self: &Arc<Self>,
        task: TaskRequest,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let span = CorrelationId::new().task_span(&task.conversation_id);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_locked(task).await }.instrument(span));
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(OrchestratorError::Panicked(join_error_message(e))),
        }
    }

    async fn run_locked(self: Arc<Self>, task: TaskRequest) -> Result<TaskOutcome, OrchestratorError> {
        let conversation_id = task.conversation_id.clone();
        let _guard = self.lock.lock(&conversation_id).await;
        let worker = Arc::clone(&self);
        let body = tokio::spawn(async move { worker.process(task).await }.in_current_span());
        match body.await {
            Ok(result) => result,
            Err(e) => {
                let message = join_error_message(e);
                error!(%message, "Task aborted unexpectedly");
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.incr(counters::TASK_PANICKED);
                self.abort_active_run(&conversation_id, &message).await;
                Err(OrchestratorError::Panicked(message))
            }
        }
    }

    /// Run [`Self::handle_task`] in the background. Errors are also logged.
    pub fn dispatch(
        self: &Arc<Self>,
        task: TaskRequest,
    ) -> JoinHandle<Result<TaskOutcome, OrchestratorError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let conversation_id = task.conversation_id.clone();
            let result = this.handle_task(task).await;
            if let Err(e) = &result {
                error!(%conversation_id, error = %e, "Task failed");
            }
            result
        })
    }

    async fn abort_active_run(&self, conversation_id: &str, reason: &str) {
        match self
            .coordinator
            .abort_active_run(conversation_id, &format!("aborted: {reason}"))
            .await
        {
            Ok(Some(run)) => warn!(run_id = %run.id, "Failed run left behind by aborted task"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Could not fail run left behind by aborted task"),
        }
    }

    async fn process(&self, task: TaskRequest) -> Result<TaskOutcome, OrchestratorError> {
        let workspace = match self.resolve_workspace(&task).await {
            Ok(Resolution::Ready(workspace)) => workspace,
            Ok(Resolution::Blocked(decision)) => {
                deliver(
                    self.notifier.as_ref(),
                    &task.conversation_id,
                    &format!(
                        "Workspace limit reached for `{}` ({}/{} in use) and none could be freed. \
                         Finish or close other tasks and try again.",
                        task.codebase_id, decision.active_count, decision.limit
                    ),
                )
                .await;
                return Ok(TaskOutcome::CapacityExhausted(decision));
            }
            Err(e) => {
                deliver(
                    self.notifier.as_ref(),
                    &task.conversation_id,
                    &format!("Could not prepare a workspace: {e}"),
                )
                .await;
                return Err(e);
            }
        };

        let ctx = RunContext {
            conversation_id: task.conversation_id.clone(),
            codebase_id: task.codebase_id.clone(),
            workspace_id: Some(workspace.id.clone()),
            cwd: workspace.path.clone(),
            workflow_id: task.workflow_id.clone(),
        };
        let outcome = self
            .coordinator
            .start(&ctx, &task.workflow, &task.message)
            .await?;

        Ok(TaskOutcome::Ran { workspace, outcome })
    }

    /// Reuse the live workspace for this workflow or allocate a new one.
    #[instrument(skip_all, fields(codebase_id = %task.codebase_id, workflow_id = %task.workflow_id))]
    async fn resolve_workspace(&self, task: &TaskRequest) -> Result<Resolution, OrchestratorError> {
        if let Some(existing) = self
            .store
            .find_workspace(&task.codebase_id, task.workflow_type, &task.workflow_id)
            .await?
        {
            if existing.path.exists() {
                info!(workspace = %existing.id, "Reusing workspace");
                self.store.touch_workspace(&existing.id).await?;
                return Ok(Resolution::Ready(existing));
            }
            warn!(workspace = %existing.id, "Workspace directory vanished, allocating a new one");
            self.store
                .update_workspace_status(&existing.id, WorkspaceStatus::Destroyed)
                .await?;
            self.provider.forget(&existing).await;
        }

        // Held until the new record is persisted so that concurrent tasks in
        // this codebase count it.
        let reservation = self.eviction.reserve_capacity(&task.codebase_id).await?;
        if !reservation.decision.has_room {
            return Ok(Resolution::Blocked(reservation.decision));
        }

        let workspace = self.provider.create(&task.workspace_request()).await?;
        let copied = self.provider.copy_auxiliary_files(&workspace).await;
        if copied.outcome().is_failed() {
            warn!(workspace = %workspace.id, outcome = %copied.outcome(), "Auxiliary files incomplete");
        }
        self.store.create_workspace(&workspace).await?;
        drop(reservation);
        Ok(Resolution::Ready(workspace))
    }

    /// Remove a workspace on request. `None` if it was already destroyed.
    pub async fn remove_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Option<DestroyReport>, OrchestratorError> {
        Ok(self.eviction.remove_workspace(workspace_id).await?)
    }
}

fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "task cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodebaseConfig;
    use crate::error::EvictionError;
    use crate::testing::{CountingStore, FakeVcs, RecordingNotifier, Scripted, ScriptedClient, VcsCall};
    use crate::workflow::{PromptResolver, RunStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        vcs: Arc<FakeVcs>,
        store: Arc<CountingStore>,
        client: Arc<ScriptedClient>,
        notifier: Arc<RecordingNotifier>,
        orchestrator: Arc<TaskOrchestrator>,
    }

    fn fixture(limit: usize, script: Vec<Scripted>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        let commands = temp.path().join("commands");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::create_dir_all(&commands).unwrap();
        std::fs::write(commands.join("plan.md"), "Plan $ARGUMENTS").unwrap();
        std::fs::write(commands.join("implement.md"), "Implement $WORKFLOW_ID").unwrap();

        let vcs = Arc::new(FakeVcs::new());
        let provider: Arc<dyn WorkspaceProvider> = Arc::new(WorktreeProvider::new(
            vcs.clone(),
            temp.path().join("worktrees"),
            [CodebaseConfig::new("api", &repo)],
        ));
        let store = Arc::new(CountingStore::in_memory());
        let client = Arc::new(ScriptedClient::new(script));
        let notifier = Arc::new(RecordingNotifier::new());
        let lock = ConversationLock::new();
        let eviction = Arc::new(EvictionScheduler::new(
            store.clone(),
            provider.clone(),
            lock.clone(),
            limit,
            chrono::Duration::days(14),
        ));
        let coordinator = Arc::new(
            WorkflowRunCoordinator::new(
                store.clone(),
                client.clone(),
                notifier.clone(),
                PromptResolver::new([commands]),
            )
            .with_lock(lock.clone())
            .with_step_timeout(Duration::from_secs(5)),
        );
        let orchestrator = Arc::new(TaskOrchestrator::new(
            store.clone(),
            provider,
            eviction,
            coordinator,
            notifier.clone(),
            lock,
        ));

        Fixture {
            _temp: temp,
            vcs,
            store,
            client,
            notifier,
            orchestrator,
        }
    }

    fn task(conversation: &str, issue: &str) -> TaskRequest {
        TaskRequest {
            conversation_id: conversation.to_string(),
            codebase_id: "api".to_string(),
            workflow_type: WorkflowType::Issue,
            workflow_id: issue.to_string(),
            pr_number: None,
            pr_sha: None,
            workflow: WorkflowDefinition::from_commands("fix", &["plan", "implement"]),
            message: "fix it".to_string(),
        }
    }

    fn ran(outcome: TaskOutcome) -> (Workspace, RunOutcome) {
        match outcome {
            TaskOutcome::Ran { workspace, outcome } => (workspace, outcome),
            other => panic!("expected a run, got {other:?}"),
        }
    }

    /// Make an existing workspace old enough to evict.
    async fn age(fx: &Fixture, ws: &Workspace) {
        let mut aged = ws.clone();
        aged.last_activity_at = chrono::Utc::now() - chrono::Duration::days(30);
        fx.store
            .update_workspace_status(&ws.id, WorkspaceStatus::Destroyed)
            .await
            .unwrap();
        fx.store.create_workspace(&aged).await.unwrap();
        crate::testing::age_directory(&ws.path, 30);
    }

    #[tokio::test]
    async fn test_task_runs_in_fresh_workspace() {
        let fx = fixture(3, vec![]);
        let (workspace, outcome) = ran(fx.orchestrator.handle_task(task("c1", "42")).await.unwrap());

        assert!(outcome.is_completed());
        assert!(workspace.path.exists());
        assert_eq!(
            fx.store.get_workspace(&workspace.id).await.unwrap().unwrap().status,
            WorkspaceStatus::Active
        );
        let run = outcome.run().unwrap();
        assert_eq!(run.workspace_id.as_deref(), Some(workspace.id.as_str()));

        let requests = fx.client.requests();
        assert_eq!(requests[0].cwd, workspace.path);
        assert_eq!(requests[1].prompt, "Implement 42");
    }

    #[tokio::test]
    async fn test_follow_up_reuses_workspace() {
        let fx = fixture(3, vec![]);
        let (first, _) = ran(fx.orchestrator.handle_task(task("c1", "42")).await.unwrap());
        let (second, outcome) = ran(fx.orchestrator.handle_task(task("c1", "42")).await.unwrap());

        assert_eq!(first.id, second.id);
        assert!(outcome.is_completed());
        assert_eq!(fx.vcs.count(|c| matches!(c, VcsCall::AddWorktree { .. })), 1);
        assert_eq!(fx.store.count_active_workspaces("api").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vanished_workspace_is_recreated() {
        let fx = fixture(3, vec![]);
        let (first, _) = ran(fx.orchestrator.handle_task(task("c1", "42")).await.unwrap());
        std::fs::remove_dir_all(&first.path).unwrap();

        let (second, outcome) = ran(fx.orchestrator.handle_task(task("c1", "42")).await.unwrap());
        assert!(outcome.is_completed());
        assert!(second.path.exists());
        assert_eq!(fx.store.count_active_workspaces("api").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_at_limit_with_nothing_to_free_is_blocked_without_fallback() {
        let fx = fixture(1, vec![]);
        ran(fx.orchestrator.handle_task(task("c1", "1")).await.unwrap());
        let requests_before = fx.client.requests().len();

        let outcome = fx.orchestrator.handle_task(task("c2", "2")).await.unwrap();

        assert!(matches!(
            outcome,
            TaskOutcome::CapacityExhausted(CapacityDecision { has_room: false, .. })
        ));
        assert_eq!(fx.vcs.count(|c| matches!(c, VcsCall::AddWorktree { .. })), 1);
        assert_eq!(fx.client.requests().len(), requests_before);
        assert_eq!(fx.store.create_run_calls(), 1);
        assert!(fx.notifier.contains("c2", "Workspace limit reached"));
    }

    #[tokio::test]
    async fn test_at_limit_sweep_frees_one_and_request_succeeds() {
        let fx = fixture(2, vec![]);
        let (old, _) = ran(fx.orchestrator.handle_task(task("c1", "1")).await.unwrap());
        ran(fx.orchestrator.handle_task(task("c2", "2")).await.unwrap());
        age(&fx, &old).await;

        let (fresh, outcome) = ran(fx.orchestrator.handle_task(task("c3", "3")).await.unwrap());

        assert!(outcome.is_completed());
        assert!(!old.path.exists());
        assert!(fresh.path.exists());
        assert_eq!(fx.store.count_active_workspaces("api").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_conversations_never_exceed_the_limit() {
        let fx = fixture(1, vec![]);

        let (a, b) = tokio::join!(
            fx.orchestrator.handle_task(task("c1", "1")),
            fx.orchestrator.handle_task(task("c2", "2")),
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let blocked = outcomes
            .iter()
            .filter(|o| matches!(o, TaskOutcome::CapacityExhausted(_)))
            .count();
        assert_eq!(blocked, 1);
        assert_eq!(fx.store.count_active_workspaces("api").await.unwrap(), 1);
        assert_eq!(fx.vcs.count(|c| matches!(c, VcsCall::AddWorktree { .. })), 1);
    }

    #[tokio::test]
    async fn test_same_conversation_tasks_are_serialized() {
        let fx = fixture(3, vec![
            Scripted::Delay(Duration::from_millis(50), "slow".to_string()),
        ]);
        let a = fx.orchestrator.dispatch(task("c1", "42"));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = fx.orchestrator.dispatch(task("c1", "42"));

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        // The second task waited for the first instead of being rejected.
        assert!(ran(a).1.is_completed());
        assert!(ran(b).1.is_completed());
        assert_eq!(fx.store.list_runs(Some("c1"), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_task_fails_its_run_and_releases_the_lock() {
        let fx = fixture(3, vec![Scripted::Panic("agent exploded".to_string())]);

        let err = fx.orchestrator.handle_task(task("c1", "42")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Panicked(ref m) if m.contains("agent exploded")));
        assert!(!fx.orchestrator.lock().is_locked("c1"));

        let runs = fx.store.list_runs(Some("c1"), 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);

        // The service keeps going for the same conversation.
        let (_, outcome) = ran(fx.orchestrator.handle_task(task("c1", "42")).await.unwrap());
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn test_dropped_caller_keeps_lock_until_body_finishes() {
        let fx = fixture(3, vec![
            Scripted::Delay(Duration::from_millis(100), "slow".to_string()),
        ]);
        let orchestrator = fx.orchestrator.clone();
        let caller = tokio::spawn(async move { orchestrator.handle_task(task("c1", "42")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();
        let _ = caller.await;

        assert!(fx.orchestrator.lock().is_locked("c1"));

        // The next task waits for the detached body, then runs normally.
        let (_, outcome) = ran(fx.orchestrator.handle_task(task("c1", "42")).await.unwrap());
        assert!(outcome.is_completed());
        let runs = fx.store.list_runs(Some("c1"), 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
    }

    #[tokio::test]
    async fn test_remove_workspace() {
        let fx = fixture(3, vec![]);
        let (ws, _) = ran(fx.orchestrator.handle_task(task("c1", "42")).await.unwrap());

        let report = fx.orchestrator.remove_workspace(&ws.id).await.unwrap().unwrap();
        assert!(report.worktree_removed);
        assert!(!ws.path.exists());
        assert_eq!(
            fx.store.get_workspace(&ws.id).await.unwrap().unwrap().status,
            WorkspaceStatus::Destroyed
        );

        assert!(fx.orchestrator.remove_workspace(&ws.id).await.unwrap().is_none());
        assert!(matches!(
            fx.orchestrator.remove_workspace("/nope").await,
            Err(OrchestratorError::Eviction(EvictionError::NotFound(_)))
        ));
    }

    #[test]
    fn test_task_request_json() {
        let json = r#"{
            "conversationId": "slack:C1:171",
            "codebaseId": "api",
            "workflowType": "review",
            "workflowId": "88",
            "prNumber": 88,
            "workflow": {"name": "review", "steps": [{"command": "review"}]},
            "message": "please review"
        }"#;
        let task: TaskRequest = serde_json::from_str(json).unwrap();
        let request = task.workspace_request();
        assert_eq!(request.pr_number, Some(88));
        assert_eq!(request.branch_name(), "review-88");
    }
}
