// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow run coordinator.
//!
//! Drives one run through `running -> completed | failed`. The store refuses a
//! second `running` run for a conversation, so the "already running" guard
//! holds even if two callers race past the initial lookup. Every step failure
//! ends the run; the error class only changes the hint the user sees.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, instrument, trace, warn, Span};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{counters, GLOBAL_METRICS};

use crate::config::ResolvedConfig;
use crate::error::{CoordinatorError, ProviderError, StoreError};
use crate::lock::ConversationLock;
use crate::outcome::BestEffort;
use crate::store::Store;
use crate::types::{CompletionEvent, CompletionRequest, CompletionResponse, EventCallback, SharedClient};

use super::classify::{diagnose_provider_error, ErrorClass};
use super::notify::{deliver, Notifier};
use super::prompt::{PromptResolver, PromptVariables};
use super::types::{
    NewRunEvent, NewWorkflowRun, RunContext, RunEventKind, RunStatus, StepDefinition,
    WorkflowDefinition, WorkflowRun,
};

/// Error recorded on runs failed by reconciliation.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: the coordinator restarted while this run was in progress";

/// How a call to [`WorkflowRunCoordinator::start`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run is already `running` for the conversation. Nothing was created.
    Rejected { existing_run_id: String },
    Completed { run: WorkflowRun },
    Failed {
        run: WorkflowRun,
        class: ErrorClass,
        message: String,
    },
}

impl RunOutcome {
    /// The run this outcome refers to, if one was created.
    pub fn run(&self) -> Option<&WorkflowRun> {
        match self {
            Self::Rejected { .. } => None,
            Self::Completed { run } | Self::Failed { run, .. } => Some(run),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Runs moved to `failed`.
    pub reconciled: Vec<String>,
    /// Runs left alone: still within the grace period or held by a live task.
    pub skipped: usize,
}

/// Why a step failed, with the text shown to the user.
struct StepFailure {
    class: ErrorClass,
    message: String,
    hint: String,
}

impl StepFailure {
    fn provider(error: &ProviderError) -> Self {
        let cause = diagnose_provider_error(error);
        Self {
            class: cause.class(),
            message: error.to_string(),
            hint: cause.hint().to_string(),
        }
    }
}

/// Runs workflows against the completion API.
pub struct WorkflowRunCoordinator {
    store: Arc<dyn Store>,
    client: SharedClient,
    notifier: Arc<dyn Notifier>,
    prompts: PromptResolver,
    lock: ConversationLock,
    step_timeout: Duration,
}

impl WorkflowRunCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        client: SharedClient,
        notifier: Arc<dyn Notifier>,
        prompts: PromptResolver,
    ) -> Self {
        Self {
            store,
            client,
            notifier,
            prompts,
            lock: ConversationLock::new(),
            step_timeout: Duration::from_secs(crate::config::DEFAULT_COMPLETION_TIMEOUT_SECS),
        }
    }

    pub fn from_config(
        store: Arc<dyn Store>,
        client: SharedClient,
        notifier: Arc<dyn Notifier>,
        config: &ResolvedConfig,
    ) -> Self {
        Self::new(store, client, notifier, PromptResolver::new(config.command_dirs.clone()))
            .with_step_timeout(config.completion_timeout())
    }

    /// Share the lock table so reconciliation can tell live runs apart.
    pub fn with_lock(mut self, lock: ConversationLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn notify(&self, conversation_id: &str, text: &str) -> BestEffort {
        deliver(self.notifier.as_ref(), conversation_id, text).await
    }

    /// Start and drive a run to a terminal state.
    ///
    /// Returns `Err` only when the store fails; the run is then marked failed
    /// on a best-effort basis.
    #[instrument(
        skip_all,
        fields(conversation_id = %ctx.conversation_id, workflow = %workflow.name, run_id = tracing::field::Empty)
    )]
    pub async fn start(
        &self,
        ctx: &RunContext,
        workflow: &WorkflowDefinition,
        user_message: &str,
    ) -> Result<RunOutcome, CoordinatorError> {
        if workflow.steps.is_empty() {
            return Err(CoordinatorError::EmptyWorkflow(workflow.name.clone()));
        }

        if let Some(existing) = self.store.get_active_run(&ctx.conversation_id).await? {
            return Ok(self.reject(ctx, &existing.id).await);
        }

        let commands: Vec<&str> = workflow.steps.iter().map(|s| s.command.as_str()).collect();
        let new_run = NewWorkflowRun {
            workflow_name: workflow.name.clone(),
            conversation_id: ctx.conversation_id.clone(),
            codebase_id: ctx.codebase_id.clone(),
            workspace_id: ctx.workspace_id.clone(),
            user_message: user_message.to_string(),
            metadata: serde_json::json!({
                "workflowId": ctx.workflow_id,
                "steps": commands,
                "cwd": ctx.cwd.to_string_lossy(),
            }),
        };

        let run = match self.store.create_run(new_run).await {
            Ok(run) => run,
            Err(StoreError::Conflict(_)) => {
                // Lost a race with another caller after the lookup above.
                let existing = self.store.get_active_run(&ctx.conversation_id).await?;
                let existing_id = existing.map(|r| r.id).unwrap_or_default();
                return Ok(self.reject(ctx, &existing_id).await);
            }
            Err(e) => return Err(e.into()),
        };

        Span::current().record("run_id", run.id.as_str());
        info!(steps = workflow.steps.len(), "Workflow run started");
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::RUN_STARTED);

        self.notify(
            &ctx.conversation_id,
            &format!(
                "Starting workflow `{}` ({} step{}).",
                workflow.name,
                workflow.steps.len(),
                if workflow.steps.len() == 1 { "" } else { "s" }
            ),
        )
        .await;

        match self.drive(&run, ctx, workflow, user_message).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Store failure during workflow run");
                let marked = self
                    .store
                    .update_run_status(&run.id, RunStatus::Failed, Some(&e.to_string()))
                    .await
                    .map(|_| ());
                BestEffort::from_result("mark run failed", marked);
                self.notify(
                    &ctx.conversation_id,
                    &format!("Workflow `{}` failed: internal storage error.", workflow.name),
                )
                .await;
                Err(e.into())
            }
        }
    }

    async fn reject(&self, ctx: &RunContext, existing_run_id: &str) -> RunOutcome {
        info!(existing_run_id, "Workflow already running for conversation");
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::RUN_REJECTED);
        self.notify(
            &ctx.conversation_id,
            &format!(
                "A workflow is already running for this conversation (run {existing_run_id}). \
                 Wait for it to finish before starting another."
            ),
        )
        .await;
        RunOutcome::Rejected {
            existing_run_id: existing_run_id.to_string(),
        }
    }

    /// Execute the steps of a created run. Only store failures escape.
    async fn drive(
        &self,
        run: &WorkflowRun,
        ctx: &RunContext,
        workflow: &WorkflowDefinition,
        user_message: &str,
    ) -> Result<RunOutcome, StoreError> {
        let vars = PromptVariables::new(user_message, ctx.workflow_id.clone());
        let total = workflow.steps.len();
        let mut session: Option<String> = None;

        for (index, step) in workflow.steps.iter().enumerate() {
            debug!(step = index, command = %step.command, "Running step");

            let prompt = match self.prompts.resolve(&step.command, &ctx.cwd, &vars) {
                Ok(prompt) => prompt,
                Err(e) => {
                    let failure = StepFailure {
                        class: ErrorClass::Fatal,
                        message: e.to_string(),
                        hint: e.guidance(),
                    };
                    return self.fail_run(run, ctx, workflow, index, step, failure).await;
                }
            };

            let resume = if step.clear_context { None } else { session.clone() };
            let response = match self.execute_step(ctx, prompt, resume).await {
                Ok(response) => response,
                Err(e) => {
                    let failure = StepFailure::provider(&e);
                    return self.fail_run(run, ctx, workflow, index, step, failure).await;
                }
            };

            if !response.session_id.is_empty() {
                session = Some(response.session_id.clone());
            }

            self.store
                .append_run_event(NewRunEvent {
                    run_id: run.id.clone(),
                    step_index: index,
                    kind: RunEventKind::StepCompleted,
                    command: step.command.clone(),
                    detail: response.usage.map(|u| {
                        format!("{} input / {} output tokens", u.input_tokens, u.output_tokens)
                    }),
                })
                .await?;
            self.store.update_run_step(&run.id, index + 1).await?;
            self.touch_workspace(ctx).await;

            self.notify(
                &ctx.conversation_id,
                &format!("Step {}/{} `{}` completed.", index + 1, total, step.command),
            )
            .await;
        }

        let completed = self
            .store
            .update_run_status(&run.id, RunStatus::Completed, None)
            .await?;
        info!(run_id = %run.id, "Workflow run completed");
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::RUN_COMPLETED);

        self.notify(
            &ctx.conversation_id,
            &format!("Workflow `{}` completed.", workflow.name),
        )
        .await;

        Ok(RunOutcome::Completed { run: completed })
    }

    /// One completion call under the step timeout.
    async fn execute_step(
        &self,
        ctx: &RunContext,
        prompt: String,
        resume: Option<String>,
    ) -> Result<CompletionResponse, ProviderError> {
        let start = Instant::now();
        let request = CompletionRequest::new(prompt, ctx.cwd.clone()).resuming(resume);
        let on_event: EventCallback = Box::new(|event| match event {
            CompletionEvent::Text(text) => trace!(len = text.len(), "Completion text"),
            CompletionEvent::ToolUse { name, .. } => debug!(tool = %name, "Completion tool use"),
            CompletionEvent::Result { session_id, .. } => trace!(%session_id, "Completion result"),
        });

        let result = match tokio::time::timeout(
            self.step_timeout,
            self.client.stream_query(request, on_event),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.step_timeout.as_millis() as u64)),
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("workflow.step", start.elapsed());
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        result
    }

    async fn touch_workspace(&self, ctx: &RunContext) {
        if let Some(workspace_id) = &ctx.workspace_id {
            let touched = self.store.touch_workspace(workspace_id).await;
            if let Err(e) = touched {
                debug!(workspace = %workspace_id, error = %e, "Could not bump workspace activity");
            }
        }
    }

    async fn fail_run(
        &self,
        run: &WorkflowRun,
        ctx: &RunContext,
        workflow: &WorkflowDefinition,
        index: usize,
        step: &StepDefinition,
        failure: StepFailure,
    ) -> Result<RunOutcome, StoreError> {
        error!(
            run_id = %run.id,
            step = index,
            command = %step.command,
            class = %failure.class,
            error = %failure.message,
            "Workflow step failed"
        );

        self.store
            .append_run_event(NewRunEvent {
                run_id: run.id.clone(),
                step_index: index,
                kind: RunEventKind::StepFailed,
                command: step.command.clone(),
                detail: Some(failure.message.clone()),
            })
            .await?;
        let failed = self
            .store
            .update_run_status(&run.id, RunStatus::Failed, Some(&failure.message))
            .await?;
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::RUN_FAILED);

        self.notify(
            &ctx.conversation_id,
            &format!(
                "Workflow `{}` failed at step {}/{} (`{}`): {}\n{}",
                workflow.name,
                index + 1,
                workflow.steps.len(),
                step.command,
                failure.message,
                failure.hint
            ),
        )
        .await;

        Ok(RunOutcome::Failed {
            run: failed,
            class: failure.class,
            message: failure.message,
        })
    }

    /// Fail runs left `running` by an unclean shutdown.
    ///
    /// A run is abandoned when its conversation lock is not held in this
    /// process and it has shown no activity for `grace`.
    #[instrument(skip(self))]
    pub async fn reconcile_abandoned_runs(
        &self,
        grace: chrono::Duration,
    ) -> Result<ReconcileReport, StoreError> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        for run in self.store.list_running_runs().await? {
            if self.lock.is_locked(&run.conversation_id) {
                report.skipped += 1;
                continue;
            }
            if now - run.last_activity_at < grace {
                report.skipped += 1;
                continue;
            }

            let notice = format!(
                "Workflow `{}` was interrupted by a restart and has been marked failed. \
                 Start it again to continue.",
                run.workflow_name
            );
            if !self.interrupt(&run, INTERRUPTED_MESSAGE, &notice).await? {
                // Finished between the listing and the update.
                report.skipped += 1;
                continue;
            }
            warn!(
                run_id = %run.id,
                conversation_id = %run.conversation_id,
                idle_minutes = (now - run.last_activity_at).num_minutes(),
                "Reconciled abandoned workflow run"
            );
            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.incr(counters::RUN_RECONCILED);
            report.reconciled.push(run.id);
        }

        Ok(report)
    }

    /// Fail the conversation's `running` run after its task died.
    ///
    /// Callers must hold the conversation lock.
    pub async fn abort_active_run(
        &self,
        conversation_id: &str,
        reason: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let Some(run) = self.store.get_active_run(conversation_id).await? else {
            return Ok(None);
        };
        let notice = format!(
            "Workflow `{}` stopped unexpectedly and has been marked failed. \
             Start it again to continue.",
            run.workflow_name
        );
        if !self.interrupt(&run, reason, &notice).await? {
            return Ok(None);
        }
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::RUN_FAILED);
        Ok(self.store.get_run(&run.id).await?)
    }

    /// Mark a `running` run failed, record why and tell the conversation.
    ///
    /// Returns `false` when the run had already reached a terminal status.
    async fn interrupt(
        &self,
        run: &WorkflowRun,
        reason: &str,
        notice: &str,
    ) -> Result<bool, StoreError> {
        match self
            .store
            .update_run_status(&run.id, RunStatus::Failed, Some(reason))
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }

        let event = self
            .store
            .append_run_event(NewRunEvent {
                run_id: run.id.clone(),
                step_index: run.current_step_index,
                kind: RunEventKind::Interrupted,
                command: run.workflow_name.clone(),
                detail: Some(reason.to_string()),
            })
            .await;
        if let Err(e) = event {
            warn!(run_id = %run.id, error = %e, "Could not record interruption event");
        }

        self.notify(&run.conversation_id, notice).await;
        Ok(true)
    }
}
