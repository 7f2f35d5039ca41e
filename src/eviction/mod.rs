// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace eviction.
//!
//! A sweep walks the live workspaces, classifies each one as active, stale or
//! merged, and removes the stale and merged ones through the workspace
//! provider. A record only becomes `destroyed` once its directory is verified
//! gone. Sweeps run periodically across all codebases and on demand for one
//! codebase when a capacity check finds it full.

mod classify;
mod scheduler;

pub use classify::{classify, last_activity, Classification, EvictionCandidate};
pub use scheduler::{
    CapacityDecision, CapacityReservation, EvictionScheduler, SkipReason, SkippedWorkspace,
    SweepReport,
};
