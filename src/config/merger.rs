// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use super::types::{ConductorConfig, ResolvedConfig};

/// CLI options (and their environment fallbacks) that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_workspaces: Option<usize>,
    pub stale_days: Option<u32>,
    pub database_path: Option<PathBuf>,
    pub worktree_base: Option<PathBuf>,
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.conductor.local.json)
/// 3. Workspace config (.conductor.json)
/// 4. Global config (~/.conductor/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<ConductorConfig>,
    workspace: Option<ConductorConfig>,
    local: Option<ConductorConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = ResolvedConfig::default();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_file_config(&mut result, config);
    }

    apply_cli_options(&mut result, cli);

    result
}

fn apply_file_config(result: &mut ResolvedConfig, config: ConductorConfig) {
    if let Some(provider) = config.provider {
        result.provider = provider;
    }
    if config.model.is_some() {
        result.model = config.model;
    }
    if config.base_url.is_some() {
        result.base_url = config.base_url;
    }
    if let Some(max) = config.max_workspaces_per_codebase {
        result.max_workspaces_per_codebase = max;
    }
    if let Some(days) = config.stale_threshold_days {
        result.stale_threshold_days = days;
    }
    if let Some(minutes) = config.sweep_interval_minutes {
        result.sweep_interval_minutes = minutes;
    }
    if let Some(secs) = config.git_timeout_secs {
        result.git_timeout_secs = secs;
    }
    if let Some(secs) = config.completion_timeout_secs {
        result.completion_timeout_secs = secs;
    }
    if let Some(minutes) = config.run_grace_minutes {
        result.run_grace_minutes = minutes;
    }

    // Search order matters, so a later list replaces an earlier one.
    if let Some(dirs) = config.command_dirs {
        result.command_dirs = dirs;
    }

    if let Some(files) = config.copy_files {
        for file in files {
            if !result.copy_files.contains(&file) {
                result.copy_files.push(file);
            }
        }
    }

    if let Some(base) = config.worktree_base {
        result.worktree_base = base;
    }
    if let Some(path) = config.database_path {
        result.database_path = path;
    }

    if let Some(codebases) = config.codebases {
        for codebase in codebases {
            match result.codebases.iter_mut().find(|c| c.id == codebase.id) {
                Some(existing) => *existing = codebase,
                None => result.codebases.push(codebase),
            }
        }
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: CliOptions) {
    if let Some(provider) = cli.provider {
        result.provider = provider;
    }
    if cli.model.is_some() {
        result.model = cli.model;
    }
    if cli.base_url.is_some() {
        result.base_url = cli.base_url;
    }
    if let Some(max) = cli.max_workspaces {
        result.max_workspaces_per_codebase = max;
    }
    if let Some(days) = cli.stale_days {
        result.stale_threshold_days = days;
    }
    if let Some(path) = cli.database_path {
        result.database_path = path;
    }
    if let Some(base) = cli.worktree_base {
        result.worktree_base = base;
    }
}
