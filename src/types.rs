// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for the completion API boundary.
//!
//! Workflow steps talk to the AI completion API through the
//! [`CompletionClient`] trait. A call takes a prompt and an optional session
//! handle from a previous step, streams incremental [`CompletionEvent`]s, and
//! finishes with a [`CompletionResponse`] carrying the handle for the next step.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

// ============================================================================
// Usage
// ============================================================================

/// Token usage statistics from a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the input/prompt
    pub input_tokens: u32,
    /// Number of tokens in the output/completion
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Get total tokens (input + output).
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

// ============================================================================
// Requests and Events
// ============================================================================

/// One request to the completion API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// Fully rendered step prompt.
    pub prompt: String,
    /// Working directory the agent operates in (the isolated workspace).
    pub cwd: PathBuf,
    /// Session handle returned by a previous call, to continue its context.
    pub resume_session: Option<String>,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            cwd: cwd.into(),
            resume_session: None,
            system_prompt: None,
        }
    }

    /// Continue the context of an earlier session.
    pub fn resuming(mut self, session: Option<String>) -> Self {
        self.resume_session = session;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// Incremental event streamed while a completion runs.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    /// A chunk of assistant text.
    Text(String),
    /// The agent invoked a tool.
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    /// Final event carrying the session handle.
    Result {
        session_id: String,
        usage: Option<TokenUsage>,
    },
}

impl CompletionEvent {
    /// Get the text content if this is a text event.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Final result of a completion call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    /// Concatenated assistant text.
    pub text: String,
    /// Handle to continue this session in a later call.
    pub session_id: String,
    /// Number of tool invocations observed.
    pub tool_uses: usize,
    /// Token usage, when the API reports it.
    pub usage: Option<TokenUsage>,
}

/// Callback invoked for each streamed event.
pub type EventCallback = Box<dyn Fn(CompletionEvent) + Send + Sync>;

// ============================================================================
// Client Trait
// ============================================================================

/// The external AI completion API.
///
/// Implementations must return an error rather than hang; the coordinator
/// additionally wraps every call in its own timeout.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send a prompt and stream the response.
    ///
    /// # Arguments
    /// * `request` - Prompt, working directory and optional session handle
    /// * `on_event` - Callback for each stream event
    ///
    /// # Returns
    /// Final response with the session handle for chaining
    async fn stream_query(
        &self,
        request: CompletionRequest,
        on_event: EventCallback,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Get the name of this client for display purposes.
    fn name(&self) -> &str;
}

/// Shared completion client.
pub type SharedClient = Arc<dyn CompletionClient>;

// ============================================================================
// Provider Configuration
// ============================================================================

/// Configuration for creating a completion client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API key for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL for the API endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Model identifier to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Request timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ProviderConfig {
    /// Create a new provider config with API key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            model: Some(model.into()),
            ..Default::default()
        }
    }

    /// Set the request timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}
