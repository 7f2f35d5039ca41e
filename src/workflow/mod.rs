// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow runs.
//!
//! A workflow is an ordered list of named steps. Each step resolves to a
//! prompt file and is sent to the completion API, optionally continuing the
//! session of the previous step. The coordinator persists every transition
//! and keeps at most one run `running` per conversation.

pub mod classify;
mod coordinator;
pub mod notify;
pub mod prompt;
mod types;

pub use classify::{
    classify_message, classify_provider_error, diagnose_message, diagnose_provider_error, ErrorClass,
    FailureCause,
};
pub use coordinator::{ReconcileReport, RunOutcome, WorkflowRunCoordinator, INTERRUPTED_MESSAGE};
pub use notify::{deliver, LogNotifier, Notifier, StdoutNotifier};
pub use prompt::{PromptResolver, PromptVariables};
pub use types::{
    NewRunEvent, NewWorkflowRun, RunContext, RunEvent, RunEventKind, RunStatus, StepDefinition,
    WorkflowDefinition, WorkflowRun,
};
