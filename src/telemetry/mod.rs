// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging, metrics and correlation IDs.
//!
//! - **Logging**: `tracing` with an `EnvFilter`-driven fmt subscriber
//! - **Metrics**: lifecycle counters and timed operations in [`GLOBAL_METRICS`]
//! - **Correlation IDs**: one per task, carried on the task span
//!
//! # Usage
//!
//! ```rust,ignore
//! use conductor::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Metric recording sites are gated on the `telemetry` feature:
//!
//! ```rust,ignore
//! #[cfg(feature = "telemetry")]
//! GLOBAL_METRICS.record_operation("git.worktree_add", start.elapsed());
//! ```

mod correlation;
mod init;
pub mod metrics;

pub use correlation::{CorrelationId, CorrelationIdExt};
pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{counters, Histogram, Metrics, MetricsSnapshot, OperationMetrics, GLOBAL_METRICS};
