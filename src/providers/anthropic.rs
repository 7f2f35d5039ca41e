// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Anthropic Claude completion client.
//!
//! Implements [`CompletionClient`] on top of the Messages API with streaming
//! (Server-Sent Events). The Messages API is stateless, so session handles are
//! minted here: each handle maps to the transcript accumulated so far, and a
//! request that resumes a handle replays that transcript before the new prompt.
//!
//! # API Reference
//!
//! See [Anthropic Messages API](https://docs.anthropic.com/en/api/messages) for details.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::error::ProviderError;
use crate::types::{
    CompletionClient, CompletionEvent, CompletionRequest, CompletionResponse, EventCallback,
    ProviderConfig, TokenUsage,
};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Default model.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default max tokens if not specified.
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Anthropic Claude completion client.
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    timeout: Duration,
    /// Transcript per session handle.
    sessions: RwLock<HashMap<String, Vec<ApiMessage>>>,
}

impl AnthropicClient {
    /// Create a new Anthropic client.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Anthropic API key
    /// * `config` - Model, base URL, token and timeout settings
    pub fn new(api_key: impl Into<String>, config: ProviderConfig) -> Result<Self, ProviderError> {
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: config.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            timeout,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Create a client from `ANTHROPIC_API_KEY` (and optional `ANTHROPIC_BASE_URL`).
    pub fn from_env(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = match config.api_key.take() {
            Some(key) => key,
            None => std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
                ProviderError::NotConfigured("ANTHROPIC_API_KEY is not set".to_string())
            })?,
        };
        if config.base_url.is_none() {
            config.base_url = std::env::var("ANTHROPIC_BASE_URL").ok();
        }
        Self::new(api_key, config)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Build the message list for a request, replaying a resumed session.
    fn build_messages(&self, request: &CompletionRequest) -> Result<Vec<ApiMessage>, ProviderError> {
        let mut messages = match &request.resume_session {
            Some(handle) => self
                .sessions
                .read()
                .get(handle)
                .cloned()
                .ok_or_else(|| ProviderError::UnknownSession(handle.clone()))?,
            None => Vec::new(),
        };
        messages.push(ApiMessage::user(&request.prompt));
        Ok(messages)
    }

    fn build_request(&self, request: &CompletionRequest, messages: Vec<ApiMessage>) -> AnthropicRequest {
        let workdir = format!(
            "You are working inside the repository checkout at {}.",
            request.cwd.display()
        );
        let system = match &request.system_prompt {
            Some(extra) => format!("{workdir}\n\n{extra}"),
            None => workdir,
        };

        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages,
            system: Some(system),
            stream: true,
        }
    }

    /// Store the transcript under a fresh session handle.
    fn record_session(&self, mut messages: Vec<ApiMessage>, reply: &str) -> String {
        messages.push(ApiMessage::assistant(reply));
        let handle = format!("sess-{}", uuid::Uuid::new_v4());
        self.sessions.write().insert(handle.clone(), messages);
        handle
    }

    /// Parse an SSE event line.
    fn parse_sse_event(line: &str) -> Option<(&str, &str)> {
        if let Some(data) = line.strip_prefix("event: ") {
            Some(("event", data.trim()))
        } else if let Some(data) = line.strip_prefix("data: ") {
            Some(("data", data.trim()))
        } else {
            None
        }
    }

    /// Handle an error response from the API.
    fn handle_error_response(status_code: u16, body: &str) -> ProviderError {
        if let Ok(error) = serde_json::from_str::<ApiError>(body) {
            let message = error.error.message;
            match error.error.error_type.as_str() {
                "authentication_error" => ProviderError::AuthError(message),
                "permission_error" => ProviderError::PermissionDenied(message),
                "rate_limit_error" => ProviderError::RateLimited(message),
                "overloaded_error" => ProviderError::RateLimited(format!("API overloaded: {message}")),
                "not_found_error" if message.contains("model") => ProviderError::ModelNotFound(message),
                _ => ProviderError::api(message, status_code),
            }
        } else {
            match status_code {
                401 => ProviderError::AuthError(body.to_string()),
                403 => ProviderError::PermissionDenied(body.to_string()),
                429 | 529 => ProviderError::RateLimited(body.to_string()),
                _ => ProviderError::api(body.to_string(), status_code),
            }
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout.as_millis() as u64)
        } else {
            ProviderError::NetworkError(err.to_string())
        }
    }

    /// Process a single SSE data event.
    fn process_stream_data(
        event_type: &str,
        data: &str,
        state: &mut StreamState,
        on_event: &(dyn Fn(CompletionEvent) + Send + Sync),
    ) -> Result<(), ProviderError> {
        let parse_err = |e: serde_json::Error| ProviderError::ParseError(e.to_string());

        match event_type {
            "message_start" => {
                let msg: MessageStartEvent = serde_json::from_str(data).map_err(parse_err)?;
                if let Some(usage) = msg.message.usage {
                    state.input_tokens = usage.input_tokens;
                }
            }
            "content_block_start" => {
                let block: ContentBlockStartEvent = serde_json::from_str(data).map_err(parse_err)?;
                if block.content_block.block_type == "tool_use" {
                    state.current_tool = block.content_block.name;
                    state.current_tool_input.clear();
                }
            }
            "content_block_delta" => {
                let delta: ContentBlockDeltaEvent = serde_json::from_str(data).map_err(parse_err)?;
                match delta.delta.delta_type.as_str() {
                    "text_delta" => {
                        if let Some(text) = delta.delta.text {
                            state.text.push_str(&text);
                            on_event(CompletionEvent::Text(text));
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.delta.partial_json {
                            state.current_tool_input.push_str(&partial);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(name) = state.current_tool.take() {
                    let input = serde_json::from_str(&state.current_tool_input)
                        .unwrap_or(serde_json::Value::Object(Default::default()));
                    state.tool_uses += 1;
                    on_event(CompletionEvent::ToolUse { name, input });
                }
            }
            "message_delta" => {
                let delta: MessageDeltaEvent = serde_json::from_str(data).map_err(parse_err)?;
                if let Some(usage) = delta.usage {
                    state.output_tokens = usage.output_tokens;
                }
            }
            "error" => {
                let error: StreamErrorEvent = serde_json::from_str(data).map_err(parse_err)?;
                return Err(Self::handle_error_response(0, &format!(
                    r#"{{"error":{{"type":"{}","message":{}}}}}"#,
                    error.error.error_type,
                    serde_json::Value::String(error.error.message)
                )));
            }
            _ => {}
        }

        Ok(())
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn stream_query(
        &self,
        request: CompletionRequest,
        on_event: EventCallback,
    ) -> Result<CompletionResponse, ProviderError> {
        let messages = self.build_messages(&request)?;
        let body = self.build_request(&request, messages.clone());
        let start = Instant::now();

        debug!(model = %self.model, messages = body.messages.len(), "Sending streaming request");

        let mut response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::handle_error_response(status.as_u16(), &error_text));
        }

        let mut state = StreamState::default();
        let mut buffer = String::new();
        let mut current_event_type = String::new();

        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout.as_millis() as u64)
            } else {
                ProviderError::StreamError(e.to_string())
            }
        })? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if let Some((field, value)) = Self::parse_sse_event(line) {
                    match field {
                        "event" => current_event_type = value.to_string(),
                        "data" => Self::process_stream_data(
                            &current_event_type,
                            value,
                            &mut state,
                            on_event.as_ref(),
                        )?,
                        _ => {}
                    }
                }
            }
        }

        let usage = TokenUsage {
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
        };
        let session_id = self.record_session(messages, &state.text);
        on_event(CompletionEvent::Result {
            session_id: session_id.clone(),
            usage: Some(usage),
        });

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.record_operation("anthropic.stream_query", start.elapsed());
            GLOBAL_METRICS.record_tokens(usage.input_tokens as u64, usage.output_tokens as u64);
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        Ok(CompletionResponse {
            text: state.text,
            session_id,
            tool_uses: state.tool_uses,
            usage: Some(usage),
        })
    }

    fn name(&self) -> &str {
        "Anthropic"
    }
}

// ============================================================================
// Stream State
// ============================================================================

/// State accumulated during streaming.
#[derive(Default)]
struct StreamState {
    text: String,
    input_tokens: u32,
    output_tokens: u32,
    tool_uses: usize,
    current_tool: Option<String>,
    current_tool_input: String,
}

// ============================================================================
// API Types
// ============================================================================

/// Request body for the Messages API.
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

/// API message format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

impl ApiMessage {
    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

/// Token usage in API format.
#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
}

/// API error response.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

// ============================================================================
// Streaming Event Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageStartMessage,
}

#[derive(Debug, Deserialize)]
struct MessageStartMessage {
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    content_block: ContentBlockStart,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    delta: ContentBlockDelta,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    #[serde(default)]
    usage: Option<MessageDeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaUsage {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamErrorEvent {
    error: ApiErrorDetail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn client() -> AnthropicClient {
        AnthropicClient::new("test-key", ProviderConfig::default()).unwrap()
    }

    fn collect() -> (Arc<Mutex<Vec<CompletionEvent>>>, EventCallback) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, Box::new(move |e| sink.lock().unwrap().push(e)))
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.name(), "Anthropic");
        assert_eq!(client.model(), DEFAULT_MODEL);
    }

    #[test]
    fn test_error_mapping() {
        let rate = AnthropicClient::handle_error_response(
            429,
            r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#,
        );
        assert!(rate.is_rate_limited());

        let auth = AnthropicClient::handle_error_response(
            401,
            r#"{"error":{"type":"authentication_error","message":"bad key"}}"#,
        );
        assert!(matches!(auth, ProviderError::AuthError(_)));

        let perm = AnthropicClient::handle_error_response(403, "forbidden");
        assert!(matches!(perm, ProviderError::PermissionDenied(_)));

        let other = AnthropicClient::handle_error_response(500, "oops");
        assert!(matches!(other, ProviderError::ApiError { status_code: Some(500), .. }));
    }

    #[test]
    fn test_stream_text_and_tool_events() {
        let (events, callback) = collect();
        let mut state = StreamState::default();

        let steps = [
            ("message_start", r#"{"message":{"usage":{"input_tokens":12}}}"#),
            ("content_block_delta", r#"{"delta":{"type":"text_delta","text":"Hello"}}"#),
            ("content_block_start", r#"{"content_block":{"type":"tool_use","name":"bash"}}"#),
            ("content_block_delta", r#"{"delta":{"type":"input_json_delta","partial_json":"{\"cmd\":\"ls\"}"}}"#),
            ("content_block_stop", r#"{}"#),
            ("message_delta", r#"{"delta":{},"usage":{"output_tokens":7}}"#),
        ];
        for (event, data) in steps {
            AnthropicClient::process_stream_data(event, data, &mut state, callback.as_ref()).unwrap();
        }

        assert_eq!(state.text, "Hello");
        assert_eq!(state.input_tokens, 12);
        assert_eq!(state.output_tokens, 7);
        assert_eq!(state.tool_uses, 1);

        let events = events.lock().unwrap();
        assert_eq!(events[0], CompletionEvent::Text("Hello".to_string()));
        assert!(matches!(&events[1], CompletionEvent::ToolUse { name, input } if name == "bash" && input["cmd"] == "ls"));
    }

    #[test]
    fn test_stream_error_event_is_classified() {
        let (_events, callback) = collect();
        let mut state = StreamState::default();
        let err = AnthropicClient::process_stream_data(
            "error",
            r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            &mut state,
            callback.as_ref(),
        )
        .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_session_chaining() {
        let client = client();
        let first = CompletionRequest::new("step one", "/ws");
        let messages = client.build_messages(&first).unwrap();
        let handle = client.record_session(messages, "done one");

        let second = CompletionRequest::new("step two", "/ws").resuming(Some(handle));
        let replay = client.build_messages(&second).unwrap();
        let roles: Vec<&str> = replay.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(replay[2].content, "step two");
    }

    #[test]
    fn test_unknown_session_rejected() {
        let client = client();
        let req = CompletionRequest::new("x", "/ws").resuming(Some("sess-missing".to_string()));
        assert!(matches!(
            client.build_messages(&req),
            Err(ProviderError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_system_prompt_mentions_workspace() {
        let client = client();
        let req = CompletionRequest::new("x", "/ws/issue-42").with_system_prompt("extra");
        let body = client.build_request(&req, Vec::new());
        let system = body.system.unwrap();
        assert!(system.contains("/ws/issue-42"));
        assert!(system.ends_with("extra"));
    }
}
