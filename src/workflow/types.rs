// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow run records and definitions.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run state. `running -> completed | failed`, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One execution of a workflow for a conversation. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_name: String,
    pub conversation_id: String,
    pub codebase_id: String,
    pub workspace_id: Option<String>,
    pub status: RunStatus,
    /// Index of the step being executed; equals the step count once completed.
    pub current_step_index: usize,
    pub user_message: String,
    pub metadata: serde_json::Value,
    /// Failure message for failed runs.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

/// Fields supplied when creating a run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkflowRun {
    pub workflow_name: String,
    pub conversation_id: String,
    pub codebase_id: String,
    pub workspace_id: Option<String>,
    pub user_message: String,
    pub metadata: serde_json::Value,
}

/// Kind of an append-only run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    StepCompleted,
    StepFailed,
    Interrupted,
}

impl RunEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl FromStr for RunEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step_completed" => Ok(Self::StepCompleted),
            "step_failed" => Ok(Self::StepFailed),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown run event kind: {other}")),
        }
    }
}

/// Append-only log entry for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub id: i64,
    pub run_id: String,
    pub step_index: usize,
    pub kind: RunEventKind,
    pub command: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRunEvent {
    pub run_id: String,
    pub step_index: usize,
    pub kind: RunEventKind,
    pub command: String,
    pub detail: Option<String>,
}

/// One step: a named command whose prompt lives in a command file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub command: String,
    /// Start a fresh completion session instead of continuing the previous one.
    #[serde(default)]
    pub clear_context: bool,
}

impl StepDefinition {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            clear_context: false,
        }
    }

    pub fn fresh(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            clear_context: true,
        }
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Build from command names. A leading `!` marks a fresh-context step.
    pub fn from_commands<S: AsRef<str>>(name: impl Into<String>, commands: &[S]) -> Self {
        let steps = commands
            .iter()
            .map(|c| match c.as_ref().strip_prefix('!') {
                Some(command) => StepDefinition::fresh(command),
                None => StepDefinition::new(c.as_ref()),
            })
            .collect();
        Self::new(name, steps)
    }
}

/// Where and for whom a run executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub conversation_id: String,
    pub codebase_id: String,
    pub workspace_id: Option<String>,
    /// Directory the completion agent works in.
    pub cwd: PathBuf,
    /// Exposed to prompts as `$WORKFLOW_ID`.
    pub workflow_id: String,
}
