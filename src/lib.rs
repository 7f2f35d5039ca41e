// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conductor - isolated workspaces and multi-step AI workflows.
//!
//! Each inbound task gets its own git worktree cut from a canonical repository
//! and runs an ordered list of AI completion steps inside it, one task at a
//! time per conversation.
//!
//! # Architecture
//!
//! - [`workspace`] - Git worktree creation, adoption and removal
//! - [`eviction`] - Stale/merged classification, sweeps and capacity checks
//! - [`lock`] - Per-conversation serialization
//! - [`workflow`] - Step execution, error classification and notifications
//! - [`store`] - Durable workspace and run records (SQLite)
//! - [`orchestrator`] - Ties the pieces together for one task
//! - [`providers`] - Completion API clients
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing, metrics, and correlation IDs
//! - [`types`] - The completion API boundary
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conductor::config::{load_config, CliOptions};
//! use conductor::orchestrator::TaskOrchestrator;
//! use conductor::providers::create_client;
//! use conductor::workflow::LogNotifier;
//!
//! let config = load_config(".".as_ref(), CliOptions::default())?;
//! let client = create_client(&config)?;
//! let orchestrator = Arc::new(TaskOrchestrator::from_config(&config, client, Arc::new(LogNotifier))?);
//! let outcome = orchestrator.handle_task(task).await?;
//! ```

pub mod config;
pub mod error;
pub mod eviction;
pub mod lock;
pub mod orchestrator;
pub mod outcome;
pub mod providers;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod workflow;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at crate root
pub use error::{
    ConfigError, CoordinatorError, EvictionError, OrchestratorError, ProviderError, Result,
    StoreError, WorkspaceError,
};
pub use eviction::{CapacityDecision, EvictionScheduler, SweepReport};
pub use lock::ConversationLock;
pub use orchestrator::{TaskOrchestrator, TaskOutcome, TaskRequest};
pub use store::{SqliteStore, Store};
pub use types::{CompletionClient, CompletionRequest, CompletionResponse, SharedClient};
pub use workflow::{RunOutcome, WorkflowDefinition, WorkflowRun, WorkflowRunCoordinator};
pub use workspace::{Workspace, WorkspaceProvider, WorktreeProvider};

/// Conductor version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
