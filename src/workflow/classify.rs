// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Step failure classification.
//!
//! Failures are matched against an ordered table of `(predicate, cause)`
//! rules over a normalized (lowercased, whitespace-collapsed) message. The
//! first matching rule wins. Typed [`ProviderError`] variants are diagnosed
//! directly and only fall through to the table when the variant says nothing
//! about the cause.
//!
//! Each [`FailureCause`] maps to one coarse [`ErrorClass`]. Neither changes
//! control flow: every step failure ends the run. They only select the hint
//! shown to the user.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Coarse cause of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Rate limits, timeouts, network trouble. Retrying later may work.
    Transient,
    /// Authentication or permission problems. Needs a configuration change.
    Fatal,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Unknown => "unknown",
        }
    }

    /// Generic remediation hint for the class.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Transient => "This looks temporary. Please wait and retry.",
            Self::Fatal => FailureCause::Configuration.hint(),
            Self::Unknown => FailureCause::Unrecognized.hint(),
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failure message or error variant points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureCause {
    RateLimit,
    Timeout,
    Network,
    /// Credentials, permissions or a missing model.
    Configuration,
    Unrecognized,
}

impl FailureCause {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimit | Self::Timeout | Self::Network => ErrorClass::Transient,
            Self::Configuration => ErrorClass::Fatal,
            Self::Unrecognized => ErrorClass::Unknown,
        }
    }

    /// User-facing remediation hint.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::RateLimit => "The AI service is rate limited, wait and retry in a few minutes.",
            Self::Timeout => "The request timed out. Wait a moment and retry.",
            Self::Network => {
                "A network problem interrupted the request. Check connectivity and retry."
            }
            Self::Configuration => {
                "This looks like a configuration problem. Please check credentials and permissions before retrying."
            }
            Self::Unrecognized => "An unexpected error occurred. Check the logs for details.",
        }
    }
}

/// A predicate over a normalized message.
pub type Predicate = fn(&str) -> bool;

static RATE_LIMIT_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(429|529)\b").unwrap());
static AUTH_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(401|403)\b").unwrap());
static GATEWAY_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(502|503|504)\b").unwrap());

fn contains_any(message: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| message.contains(needle))
}

fn is_rate_limit(message: &str) -> bool {
    contains_any(
        message,
        &["rate limit", "rate_limit", "too many requests", "overloaded", "quota exceeded"],
    ) || RATE_LIMIT_STATUS.is_match(message)
}

fn is_auth(message: &str) -> bool {
    contains_any(
        message,
        &[
            "unauthorized",
            "authentication",
            "invalid api key",
            "invalid x-api-key",
            "api key not",
            "permission denied",
            "permission_error",
            "forbidden",
            "not configured",
        ],
    ) || AUTH_STATUS.is_match(message)
}

fn is_timeout(message: &str) -> bool {
    contains_any(message, &["timed out", "timeout", "deadline exceeded"])
}

fn is_network(message: &str) -> bool {
    contains_any(
        message,
        &[
            "network",
            "connection reset",
            "connection refused",
            "connection closed",
            "econnreset",
            "econnrefused",
            "enotfound",
            "socket hang up",
            "broken pipe",
            "dns error",
        ],
    ) || GATEWAY_STATUS.is_match(message)
}

/// Ordered diagnosis rules. First match wins.
pub const RULES: &[(Predicate, FailureCause)] = &[
    (is_rate_limit, FailureCause::RateLimit),
    (is_auth, FailureCause::Configuration),
    (is_timeout, FailureCause::Timeout),
    (is_network, FailureCause::Network),
];

/// Lowercase and collapse runs of whitespace.
pub fn normalize(message: &str) -> String {
    message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Diagnose a free-form failure message with [`RULES`].
pub fn diagnose_message(message: &str) -> FailureCause {
    let normalized = normalize(message);
    RULES
        .iter()
        .find(|(matches, _)| matches(&normalized))
        .map(|(_, cause)| *cause)
        .unwrap_or(FailureCause::Unrecognized)
}

pub fn classify_message(message: &str) -> ErrorClass {
    diagnose_message(message).class()
}

/// Diagnose a completion API failure.
pub fn diagnose_provider_error(error: &ProviderError) -> FailureCause {
    match error {
        ProviderError::RateLimited(_) => FailureCause::RateLimit,
        ProviderError::Timeout(_) => FailureCause::Timeout,
        ProviderError::NetworkError(_) => FailureCause::Network,
        ProviderError::AuthError(_)
        | ProviderError::PermissionDenied(_)
        | ProviderError::NotConfigured(_)
        | ProviderError::ModelNotFound(_) => FailureCause::Configuration,
        other => diagnose_message(&other.to_string()),
    }
}

pub fn classify_provider_error(error: &ProviderError) -> ErrorClass {
    diagnose_provider_error(error).class()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_table() {
        assert_eq!(classify_message("Rate limit exceeded"), ErrorClass::Transient);
        assert_eq!(classify_message("HTTP 429 Too Many Requests"), ErrorClass::Transient);
        assert_eq!(classify_message("request timed out after 300s"), ErrorClass::Transient);
        assert_eq!(classify_message("read ECONNRESET"), ErrorClass::Transient);
        assert_eq!(classify_message("upstream returned 503"), ErrorClass::Transient);
        assert_eq!(classify_message("Invalid API key provided"), ErrorClass::Fatal);
        assert_eq!(classify_message("status 401"), ErrorClass::Fatal);
        assert_eq!(classify_message("Permission denied for repo"), ErrorClass::Fatal);
        assert_eq!(classify_message("tool crashed"), ErrorClass::Unknown);
    }

    #[test]
    fn test_rule_order_prefers_rate_limit() {
        // An auth-looking message that is really a rate limit.
        assert_eq!(
            classify_message("rate limit for this API key: permission denied until reset"),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize("  Connection\n   RESET  "), "connection reset");
        assert_eq!(classify_message("Connection\n  Refused"), ErrorClass::Transient);
    }

    #[test]
    fn test_status_codes_need_word_boundaries() {
        assert_eq!(classify_message("processed 14290 tokens"), ErrorClass::Unknown);
    }

    #[test]
    fn test_typed_provider_errors() {
        assert_eq!(
            classify_provider_error(&ProviderError::RateLimited("slow down".to_string())),
            ErrorClass::Transient
        );
        assert_eq!(classify_provider_error(&ProviderError::Timeout(1000)), ErrorClass::Transient);
        assert_eq!(
            classify_provider_error(&ProviderError::AuthError("bad key".to_string())),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify_provider_error(&ProviderError::api("Overloaded", 529)),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_provider_error(&ProviderError::api_message("tool failed")),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn test_typed_errors_keep_their_cause() {
        assert_eq!(
            diagnose_provider_error(&ProviderError::Timeout(1000)),
            FailureCause::Timeout
        );
        assert_eq!(
            diagnose_provider_error(&ProviderError::NetworkError("reset".to_string())),
            FailureCause::Network
        );
        assert_eq!(
            diagnose_provider_error(&ProviderError::api("Overloaded", 529)),
            FailureCause::RateLimit
        );
        assert_eq!(diagnose_message("deadline exceeded"), FailureCause::Timeout);
    }

    #[test]
    fn test_hints() {
        assert!(FailureCause::RateLimit.hint().contains("rate limited, wait and retry"));
        assert_ne!(FailureCause::RateLimit.hint(), FailureCause::Timeout.hint());
        assert_ne!(FailureCause::Timeout.hint(), FailureCause::Network.hint());
        assert!(FailureCause::Configuration.hint().contains("check credentials"));
        assert!(ErrorClass::Fatal.hint().contains("check credentials"));

        for cause in [FailureCause::RateLimit, FailureCause::Timeout, FailureCause::Network] {
            assert_eq!(cause.class(), ErrorClass::Transient);
        }
        assert_eq!(FailureCause::Configuration.class(), ErrorClass::Fatal);
        assert_eq!(FailureCause::Unrecognized.class(), ErrorClass::Unknown);
    }
}
