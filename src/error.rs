// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the conductor.
//!
//! Each subsystem gets a strongly-typed error built with `thiserror`. The CLI
//! layer propagates them through `anyhow`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while talking to the completion API.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("API error: {message}")]
    ApiError {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Response parsing error: {0}")]
    ParseError(String),

    #[error("Streaming error: {0}")]
    StreamError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl ProviderError {
    /// Create an API error with status code.
    pub fn api(message: impl Into<String>, status_code: u16) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Create an API error without status code.
    pub fn api_message(message: impl Into<String>) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: None,
        }
    }

    /// Check if this error is likely to succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::NetworkError(_) | Self::Timeout(_)
        )
    }

    /// Check if this is a rate limit error.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Check if this error needs credential or permission changes.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthError(_) | Self::PermissionDenied(_))
    }
}

/// Classified reason a git subprocess failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitFailureKind {
    /// A branch or path of that name is already there.
    AlreadyExists,
    /// The target path is gone ("no such file or directory").
    PathMissing,
    /// The path exists but git does not know it as a worktree.
    NotAWorktree,
    /// The branch is checked out somewhere and cannot be deleted.
    BranchCheckedOut,
    /// Anything else.
    Other,
}

impl fmt::Display for GitFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyExists => "already exists",
            Self::PathMissing => "path missing",
            Self::NotAWorktree => "not a worktree",
            Self::BranchCheckedOut => "branch checked out",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Errors from version-control subprocess calls.
#[derive(Error, Debug, Clone)]
pub enum GitError {
    #[error("git {command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("git {command} failed ({kind}): {stderr}")]
    Failed {
        command: String,
        kind: GitFailureKind,
        stderr: String,
    },

    #[error("Failed to spawn git: {0}")]
    Spawn(String),
}

impl GitError {
    /// The classified failure kind. Timeouts and spawn failures are `Other`.
    pub fn kind(&self) -> GitFailureKind {
        match self {
            Self::Failed { kind, .. } => *kind,
            _ => GitFailureKind::Other,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == GitFailureKind::AlreadyExists
    }

    /// Path-missing and not-a-worktree both mean "nothing left to remove".
    pub fn is_already_gone(&self) -> bool {
        matches!(
            self.kind(),
            GitFailureKind::PathMissing | GitFailureKind::NotAWorktree
        )
    }
}

/// Errors that can occur while creating or destroying workspaces.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Unknown codebase: {0}")]
    UnknownCodebase(String),

    #[error("Invalid workspace request: {0}")]
    InvalidRequest(String),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Branch {branch} still collides after removing the stale branch: {source}")]
    BranchCollision { branch: String, source: GitError },

    #[error("Workspace directory still present after removal: {0}")]
    RemainderPersisted(PathBuf),

    #[error("IO error at {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl WorkspaceError {
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors from the persistence store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(err.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound(err.to_string()),
            rusqlite::Error::FromSqlConversionFailure(..) => Self::Corrupted(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Why a step command could not be turned into a prompt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("Invalid command name: {0:?}")]
    InvalidName(String),

    #[error("Command file is empty: {}", .0.display())]
    EmptyFile(PathBuf),

    #[error("Command {name:?} not found in {} search directories", searched.len())]
    NotFound { name: String, searched: Vec<PathBuf> },

    #[error("Failed to read {}: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl PromptError {
    /// User-facing remediation text for this failure.
    pub fn guidance(&self) -> String {
        match self {
            Self::InvalidName(name) => format!(
                "Command names may only contain letters, digits, '-' and '_' and must not start with a dot (got {name:?})."
            ),
            Self::EmptyFile(path) => format!(
                "The command file {} exists but is empty. Add the prompt text to it.",
                path.display()
            ),
            Self::NotFound { name, searched } => {
                let dirs: Vec<String> = searched.iter().map(|p| p.display().to_string()).collect();
                format!(
                    "No command file named {name}.md was found. Looked in: {}",
                    dirs.join(", ")
                )
            }
            Self::Io { path, message } => {
                format!("Could not read {}: {message}", path.display())
            }
        }
    }
}

/// Notification delivery failure.
#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Errors the workflow run coordinator cannot turn into a terminal run state.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Workflow has no steps: {0}")]
    EmptyWorkflow(String),
}

/// Errors from removing a workspace on request.
#[derive(Error, Debug)]
pub enum EvictionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Workspace not found: {0}")]
    NotFound(String),
}

/// Errors surfaced by the task orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("{0}")]
    Eviction(#[from] EvictionError),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
