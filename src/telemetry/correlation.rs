// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Correlation IDs tying together everything one task does.
//!
//! A task moves through the lock, the workspace provider, the coordinator and
//! the notifier, often on different tokio workers. Each task gets one
//! [`CorrelationId`] and all of its work runs inside [`CorrelationId::task_span`].

use std::fmt;

use tracing::Span;
use uuid::Uuid;

/// Identifier attached to every log line of one task.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First 8 hex characters, enough to grep logs by.
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(8).collect()
    }

    /// Span covering one task for one conversation.
    pub fn task_span(&self, conversation_id: &str) -> Span {
        tracing::info_span!(
            "task",
            correlation_id = %self.short(),
            conversation = %conversation_id,
            run_id = tracing::field::Empty,
        )
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.short())
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Record identifiers learned after a span was opened.
pub trait CorrelationIdExt {
    fn record_run_id(&self, run_id: &str);
}

impl CorrelationIdExt for Span {
    fn record_run_id(&self, run_id: &str) {
        self.record("run_id", run_id);
    }
}
