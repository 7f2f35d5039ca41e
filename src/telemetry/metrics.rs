// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process metrics for workspace and run lifecycle.
//!
//! Two kinds of measurements are kept: named counters for lifecycle events
//! (workspaces created and evicted, runs completed and failed, lock waits) and
//! timed operations with a latency histogram (git calls, sweeps, completion
//! requests). Everything lives in [`GLOBAL_METRICS`] and can be printed with
//! [`MetricsSnapshot::format_report`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Counter names used across the crate.
pub mod counters {
    pub const WORKSPACE_CREATED: &str = "workspace.created";
    pub const WORKSPACE_ADOPTED: &str = "workspace.adopted";
    pub const WORKSPACE_ORPHAN_REPAIRED: &str = "workspace.orphan_repaired";
    pub const WORKSPACE_DESTROYED: &str = "workspace.destroyed";
    pub const EVICTION_SKIPPED: &str = "eviction.skipped";
    pub const CAPACITY_EXHAUSTED: &str = "capacity.exhausted";
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_REJECTED: &str = "run.rejected";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_RECONCILED: &str = "run.reconciled";
    pub const NOTIFY_FAILED: &str = "notify.failed";
    pub const TASK_PANICKED: &str = "task.panicked";
}

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    counters: RwLock<BTreeMap<String, u64>>,
    operations: RwLock<HashMap<String, OperationMetrics>>,
    tokens: TokenMetrics,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            operations: RwLock::new(HashMap::new()),
            tokens: TokenMetrics::new(),
            start_time: Instant::now(),
        }
    }

    /// Increment a lifecycle counter by one.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a lifecycle counter.
    pub fn add(&self, name: &str, value: u64) {
        let mut counters = self.counters.write();
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Current value of a counter (zero if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Record a timed operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        let mut ops = self.operations.write();
        ops.entry(name.to_string())
            .or_insert_with(OperationMetrics::new)
            .record(duration);
    }

    pub fn record_tokens(&self, input: u64, output: u64) {
        self.tokens.input.fetch_add(input, Ordering::Relaxed);
        self.tokens.output.fetch_add(output, Ordering::Relaxed);
    }

    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations.read().get(name).cloned()
    }

    /// Total (input, output) tokens.
    pub fn token_counts(&self) -> (u64, u64) {
        (
            self.tokens.input.load(Ordering::Relaxed),
            self.tokens.output.load(Ordering::Relaxed),
        )
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (input_tokens, output_tokens) = self.token_counts();
        MetricsSnapshot {
            counters: self.counters.read().clone(),
            operations: self.operations.read().clone(),
            input_tokens,
            output_tokens,
            uptime: self.uptime(),
        }
    }

    pub fn reset(&self) {
        self.counters.write().clear();
        self.operations.write().clear();
        self.tokens.input.store(0, Ordering::Relaxed);
        self.tokens.output.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing for one named operation.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub histogram: Histogram,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            histogram: Histogram::default(),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.histogram.record(duration);
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-bucket latency histogram.
///
/// Buckets are upper bounds in milliseconds. Git calls land in the low buckets,
/// completion steps in the high ones.
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds_ms: Vec<u64>,
    counts: Vec<u64>,
}

impl Histogram {
    pub fn with_bounds(bounds_ms: Vec<u64>) -> Self {
        let counts = vec![0; bounds_ms.len() + 1];
        Self { bounds_ms, counts }
    }

    pub fn record(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let idx = self
            .bounds_ms
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.bounds_ms.len());
        self.counts[idx] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Approximate percentile, reported as the upper bound of its bucket.
    pub fn percentile(&self, p: f64) -> Duration {
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let ms = match self.bounds_ms.get(i) {
                    Some(bound) => *bound,
                    None => self.bounds_ms.last().copied().unwrap_or(0) * 10,
                };
                return Duration::from_millis(ms);
            }
        }
        Duration::ZERO
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // 10ms, 100ms, 1s, 10s, 1min, 10min
        Self::with_bounds(vec![10, 100, 1_000, 10_000, 60_000, 600_000])
    }
}

#[derive(Debug)]
struct TokenMetrics {
    input: AtomicU64,
    output: AtomicU64,
}

impl TokenMetrics {
    fn new() -> Self {
        Self {
            input: AtomicU64::new(0),
            output: AtomicU64::new(0),
        }
    }
}

/// A point-in-time copy of all metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub operations: HashMap<String, OperationMetrics>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Metrics Report ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!(
            "Tokens: {} input, {} output\n\n",
            self.input_tokens, self.output_tokens
        ));

        if !self.counters.is_empty() {
            report.push_str("Lifecycle:\n");
            for (name, value) in &self.counters {
                report.push_str(&format!("  {name}: {value}\n"));
            }
            report.push('\n');
        }

        if !self.operations.is_empty() {
            let mut names: Vec<&String> = self.operations.keys().collect();
            names.sort();
            report.push_str("Operations:\n");
            for name in names {
                let metrics = &self.operations[name];
                report.push_str(&format!(
                    "  {}: {} ops, avg {:.2?}, p99 {:.2?}\n",
                    name,
                    metrics.count,
                    metrics.avg_duration(),
                    metrics.histogram.p99()
                ));
            }
        }

        report
    }
}
