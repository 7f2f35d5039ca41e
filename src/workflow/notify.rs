// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User notifications.
//!
//! Delivery is fire-and-log: [`deliver`] never returns an error and never
//! retries. Callers get a [`BestEffort`] they may inspect.

use async_trait::async_trait;
use colored::Colorize;
use tracing::{info, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{counters, GLOBAL_METRICS};

use crate::error::NotifyError;
use crate::outcome::BestEffort;

/// Sink for messages addressed to a conversation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), NotifyError>;
}

/// Send a message, logging and swallowing any failure.
pub async fn deliver(notifier: &dyn Notifier, conversation_id: &str, text: &str) -> BestEffort {
    match notifier.send_message(conversation_id, text).await {
        Ok(()) => BestEffort::Done,
        Err(e) => {
            warn!(conversation_id, error = %e, "Notification delivery failed");
            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.incr(counters::NOTIFY_FAILED);
            BestEffort::Failed(e.to_string())
        }
    }
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), NotifyError> {
        info!(conversation_id, "{text}");
        Ok(())
    }
}

/// Prints notifications to stdout, for interactive CLI use.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), NotifyError> {
        println!("{} {}", format!("[{conversation_id}]").cyan().bold(), text);
        Ok(())
    }
}
