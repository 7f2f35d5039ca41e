// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Outcome of fire-and-log side effects.
//!
//! Branch deletion, notification delivery and auxiliary file copies must never
//! change control flow. They return a [`BestEffort`] that callers may inspect
//! for logging or metrics, and the failure has already been logged by the time
//! the value is returned.

use std::fmt;

use tracing::warn;

/// What happened to a best-effort side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    /// The side effect ran and succeeded.
    Done,
    /// Nothing needed doing.
    Skipped(String),
    /// The side effect failed. Already logged.
    Failed(String),
}

impl BestEffort {
    /// Convert a result into an outcome, logging the failure under `operation`.
    pub fn from_result<E: fmt::Display>(operation: &str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Done,
            Err(e) => {
                warn!(operation, error = %e, "best-effort operation failed");
                Self::Failed(e.to_string())
            }
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for BestEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str("done"),
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            Self::Failed(error) => write!(f, "failed ({error})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result() {
        let ok: Result<(), String> = Ok(());
        assert!(BestEffort::from_result("noop", ok).is_done());

        let err: Result<(), String> = Err("boom".to_string());
        let outcome = BestEffort::from_result("explode", err);
        assert!(outcome.is_failed());
        assert_eq!(outcome.to_string(), "failed (boom)");
    }

    #[test]
    fn test_skipped_display() {
        assert_eq!(BestEffort::skipped("no branch").to_string(), "skipped (no branch)");
    }
}
