// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Completion API clients.
//!
//! Workflow steps reach the AI completion API through
//! [`CompletionClient`](crate::types::CompletionClient). The only backend today
//! is [`anthropic::AnthropicClient`]; set `ANTHROPIC_API_KEY` and go:
//!
//! ```rust,ignore
//! use conductor::config::ResolvedConfig;
//! use conductor::providers::create_client;
//!
//! let client = create_client(&ResolvedConfig::default())?;
//! ```

pub mod anthropic;

pub use anthropic::AnthropicClient;

use std::sync::Arc;

use crate::config::ResolvedConfig;
use crate::error::ProviderError;
use crate::types::{ProviderConfig, SharedClient};

/// Supported completion backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Anthropic,
}

impl ProviderType {
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => anthropic::DEFAULT_MODEL,
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            other => Err(ProviderError::NotConfigured(format!(
                "unsupported provider: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "Anthropic"),
        }
    }
}

/// Create the completion client named by the configuration.
///
/// The API key comes from the environment. The per-request HTTP timeout is
/// the configured completion timeout.
pub fn create_client(config: &ResolvedConfig) -> Result<SharedClient, ProviderError> {
    let provider_type: ProviderType = config.provider.parse()?;
    let provider_config = ProviderConfig {
        base_url: config.base_url.clone(),
        model: config.model.clone(),
        ..Default::default()
    }
    .with_timeout_ms(config.completion_timeout().as_millis() as u64);

    match provider_type {
        ProviderType::Anthropic => Ok(Arc::new(AnthropicClient::from_env(provider_config)?)),
    }
}
