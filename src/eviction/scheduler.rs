// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sweeps and capacity checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{counters, GLOBAL_METRICS};

use crate::config::ResolvedConfig;
use crate::error::{EvictionError, StoreError, WorkspaceError};
use crate::lock::ConversationLock;
use crate::store::Store;
use crate::workflow::WorkflowRunCoordinator;
use crate::workspace::{DestroyOptions, DestroyReport, Workspace, WorkspaceProvider, WorkspaceStatus};

use super::classify::{classify, Classification, EvictionCandidate};

/// Why a sweep left a workspace alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason", content = "detail")]
pub enum SkipReason {
    /// Its conversation holds the lock or has a running workflow.
    InUse,
    /// Stale but with uncommitted work.
    UncommittedChanges,
    /// Removal failed; retried on the next sweep.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedWorkspace {
    pub workspace_id: String,
    pub reason: SkipReason,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Workspaces now recorded as destroyed.
    pub removed: Vec<String>,
    pub skipped: Vec<SkippedWorkspace>,
}

impl SweepReport {
    fn skip(&mut self, workspace: &Workspace, reason: SkipReason) {
        debug!(workspace = %workspace.id, ?reason, "Skipping workspace");
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::EVICTION_SKIPPED);
        self.skipped.push(SkippedWorkspace {
            workspace_id: workspace.id.clone(),
            reason,
        });
    }
}

/// Result of a capacity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityDecision {
    pub has_room: bool,
    /// Workspaces the targeted sweep removed.
    pub freed_count: usize,
    /// Live workspaces after the check.
    pub active_count: usize,
    pub limit: usize,
}

/// A capacity decision plus exclusive use of the codebase's capacity gate.
///
/// While it is alive no other task can count or claim workspaces in the same
/// codebase. Hold it until the new workspace is persisted, then drop it.
pub struct CapacityReservation {
    pub decision: CapacityDecision,
    _gate: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for CapacityReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityReservation")
            .field("decision", &self.decision)
            .finish_non_exhaustive()
    }
}

/// Decides which workspaces to remove and whether a codebase has room.
pub struct EvictionScheduler {
    store: Arc<dyn Store>,
    provider: Arc<dyn WorkspaceProvider>,
    lock: ConversationLock,
    max_workspaces: usize,
    stale_threshold: chrono::Duration,
    /// One gate per codebase, serializing count-then-create.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EvictionScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn WorkspaceProvider>,
        lock: ConversationLock,
        max_workspaces: usize,
        stale_threshold: chrono::Duration,
    ) -> Self {
        Self {
            store,
            provider,
            lock,
            max_workspaces,
            stale_threshold,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        store: Arc<dyn Store>,
        provider: Arc<dyn WorkspaceProvider>,
        lock: ConversationLock,
        config: &ResolvedConfig,
    ) -> Self {
        Self::new(
            store,
            provider,
            lock,
            config.max_workspaces_per_codebase,
            config.stale_threshold(),
        )
    }

    pub fn max_workspaces(&self) -> usize {
        self.max_workspaces
    }

    /// Classify live workspaces and remove the stale and merged ones.
    ///
    /// `codebase_id` restricts the sweep to one codebase.
    #[instrument(skip(self))]
    pub async fn sweep(&self, codebase_id: Option<&str>) -> Result<SweepReport, StoreError> {
        let start = Instant::now();
        let now = Utc::now();
        let mut report = SweepReport::default();

        for workspace in self.store.list_active_workspaces(codebase_id).await? {
            if !workspace.path.exists() {
                self.record_vanished(&workspace, &mut report).await?;
                continue;
            }

            // Holding the guard keeps the conversation from starting work
            // in a workspace that is being removed.
            let Some(_guard) = self.lock.try_lock(&workspace.conversation_id) else {
                report.skip(&workspace, SkipReason::InUse);
                continue;
            };
            if self
                .store
                .get_active_run(&workspace.conversation_id)
                .await?
                .is_some()
            {
                report.skip(&workspace, SkipReason::InUse);
                continue;
            }

            let merged = match self.provider.is_merged(&workspace).await {
                Ok(merged) => merged,
                Err(e) => {
                    warn!(workspace = %workspace.id, error = %e, "Merge check failed, treating as unmerged");
                    false
                }
            };

            let candidate = EvictionCandidate::new(workspace, merged, now);
            let class = classify(&candidate, self.stale_threshold);
            let workspace = candidate.workspace;
            let status = match class {
                Classification::Active => continue,
                Classification::Merged => WorkspaceStatus::Merged,
                Classification::Stale => {
                    match self.provider.has_uncommitted_changes(&workspace).await {
                        Ok(false) => {}
                        Ok(true) => {
                            report.skip(&workspace, SkipReason::UncommittedChanges);
                            continue;
                        }
                        Err(e) => {
                            report.skip(&workspace, SkipReason::Failed(e.to_string()));
                            continue;
                        }
                    }
                    WorkspaceStatus::Stale
                }
            };

            self.evict(&workspace, status, &mut report).await?;
        }

        info!(
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "Sweep finished"
        );
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("eviction.sweep", start.elapsed());
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        Ok(report)
    }

    /// The directory disappeared on its own. Record it without a remove call.
    async fn record_vanished(
        &self,
        workspace: &Workspace,
        report: &mut SweepReport,
    ) -> Result<(), StoreError> {
        info!(workspace = %workspace.id, "Workspace directory is gone, marking destroyed");
        self.store
            .update_workspace_status(&workspace.id, WorkspaceStatus::Destroyed)
            .await?;
        self.provider.forget(workspace).await;
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::WORKSPACE_DESTROYED);
        report.removed.push(workspace.id.clone());
        Ok(())
    }

    async fn evict(
        &self,
        workspace: &Workspace,
        status: WorkspaceStatus,
        report: &mut SweepReport,
    ) -> Result<(), StoreError> {
        if workspace.status == WorkspaceStatus::Active {
            self.store.update_workspace_status(&workspace.id, status).await?;
        }

        let destroyed = self
            .provider
            .destroy(
                &workspace.codebase_id,
                &workspace.id,
                DestroyOptions::forced(&workspace.branch_name),
            )
            .await;
        if let Err(e) = destroyed {
            warn!(workspace = %workspace.id, error = %e, "Failed to remove workspace");
            report.skip(workspace, SkipReason::Failed(e.to_string()));
            return Ok(());
        }

        if workspace.path.exists() {
            report.skip(
                workspace,
                SkipReason::Failed("directory still present after removal".to_string()),
            );
            return Ok(());
        }

        self.store
            .update_workspace_status(&workspace.id, WorkspaceStatus::Destroyed)
            .await?;
        info!(workspace = %workspace.id, %status, "Evicted workspace");
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::WORKSPACE_DESTROYED);
        report.removed.push(workspace.id.clone());
        Ok(())
    }

    /// Whether `codebase_id` may get another workspace, sweeping it first if full.
    ///
    /// `has_room == false` is final: the caller must not fall back to running
    /// in the canonical repository. The gate is released on return, so a
    /// caller that goes on to create a workspace should use
    /// [`Self::reserve_capacity`] instead.
    pub async fn ensure_capacity(&self, codebase_id: &str) -> Result<CapacityDecision, StoreError> {
        Ok(self.reserve_capacity(codebase_id).await?.decision)
    }

    /// Take the codebase's capacity gate, then check for room as
    /// [`Self::ensure_capacity`] does.
    ///
    /// Tasks for different conversations in the same codebase queue here, so
    /// two of them never both see the last free slot.
    #[instrument(skip(self))]
    pub async fn reserve_capacity(
        &self,
        codebase_id: &str,
    ) -> Result<CapacityReservation, StoreError> {
        let gate = self
            .gates
            .lock()
            .entry(codebase_id.to_string())
            .or_default()
            .clone();
        let guard = gate.lock_owned().await;
        let decision = self.check_capacity(codebase_id).await?;
        Ok(CapacityReservation {
            decision,
            _gate: guard,
        })
    }

    async fn check_capacity(&self, codebase_id: &str) -> Result<CapacityDecision, StoreError> {
        let count = self.store.count_active_workspaces(codebase_id).await?;
        if count < self.max_workspaces {
            return Ok(CapacityDecision {
                has_room: true,
                freed_count: 0,
                active_count: count,
                limit: self.max_workspaces,
            });
        }

        info!(count, limit = self.max_workspaces, "Workspace limit reached, sweeping");
        let report = self.sweep(Some(codebase_id)).await?;
        let after = self.store.count_active_workspaces(codebase_id).await?;
        let decision = CapacityDecision {
            has_room: after < self.max_workspaces,
            freed_count: report.removed.len(),
            active_count: after,
            limit: self.max_workspaces,
        };

        if !decision.has_room {
            warn!(count = after, limit = self.max_workspaces, "No workspace capacity after sweep");
            #[cfg(feature = "telemetry")]
            GLOBAL_METRICS.incr(counters::CAPACITY_EXHAUSTED);
        }
        Ok(decision)
    }

    /// Remove one workspace on request, under its conversation lock.
    ///
    /// Returns `None` when the workspace was already destroyed.
    #[instrument(skip(self))]
    pub async fn remove_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Option<DestroyReport>, EvictionError> {
        let workspace = self
            .store
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| EvictionError::NotFound(workspace_id.to_string()))?;
        if workspace.status == WorkspaceStatus::Destroyed {
            return Ok(None);
        }

        let _guard = self.lock.lock(&workspace.conversation_id).await;
        let report = self
            .provider
            .destroy(
                &workspace.codebase_id,
                &workspace.id,
                DestroyOptions::forced(&workspace.branch_name),
            )
            .await?;
        if workspace.path.exists() {
            return Err(WorkspaceError::RemainderPersisted(workspace.path.clone()).into());
        }
        self.store
            .update_workspace_status(&workspace.id, WorkspaceStatus::Destroyed)
            .await?;
        info!(workspace = %workspace.id, "Removed workspace");
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.incr(counters::WORKSPACE_DESTROYED);
        Ok(Some(report))
    }

    /// Run a full sweep every `interval` until `shutdown` flips to `true`.
    ///
    /// With a coordinator, each tick also reconciles abandoned runs.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        reconcile: Option<(Arc<WorkflowRunCoordinator>, chrono::Duration)>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Periodic sweeper stopping");
                            break;
                        }
                        continue;
                    }
                }

                if let Some((coordinator, grace)) = &reconcile {
                    if let Err(e) = coordinator.reconcile_abandoned_runs(*grace).await {
                        warn!(error = %e, "Run reconciliation failed");
                    }
                }
                if let Err(e) = self.sweep(None).await {
                    warn!(error = %e, "Periodic sweep failed");
                }
            }
        })
    }
}
