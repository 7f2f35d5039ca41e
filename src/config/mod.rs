// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for the conductor.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.conductor/config.json
//! - Workspace config: .conductor.json, .conductor/config.json, or conductor.config.json
//! - Local config: .conductor.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments and their environment fallbacks
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).
//! Each canonical repository may also carry `.conductor/config.yaml` listing
//! extra auxiliary files to copy into its workspaces.

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, get_global_config_dir, get_global_config_path, load_config_file,
    load_global_config, load_local_config, load_repo_config, load_workspace_config, CONFIG_FILES,
    GLOBAL_CONFIG_DIR, LOCAL_CONFIG_FILE, REPO_CONFIG_FILES,
};

pub use merger::{merge_config, CliOptions};

pub use types::{
    CodebaseConfig, ConductorConfig, RepoConfig, RepoWorktreeConfig, ResolvedConfig,
    DEFAULT_BRANCH, DEFAULT_COMMAND_DIRS, DEFAULT_COMPLETION_TIMEOUT_SECS, DEFAULT_GIT_TIMEOUT_SECS,
    DEFAULT_MAX_WORKSPACES, DEFAULT_RUN_GRACE_MINUTES, DEFAULT_STALE_THRESHOLD_DAYS,
    DEFAULT_SWEEP_INTERVAL_MINUTES,
};

use std::path::Path;

use crate::error::ConfigError;

/// Load, merge and validate all configuration sources rooted at `root`.
pub fn load_config(root: &Path, cli_options: CliOptions) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(root)?;
    let local = load_local_config(root)?;

    let config = merge_config(global, workspace, local, cli_options);
    config.validate()?;
    Ok(config)
}
