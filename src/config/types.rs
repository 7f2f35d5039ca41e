// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! [`ConductorConfig`] is the partial form read from any one file (every key
//! optional). [`ResolvedConfig`] is the merged result with defaults filled in.
//! [`RepoConfig`] is the per-repository file that lists extra auxiliary paths.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default hard cap on live workspaces per codebase.
pub const DEFAULT_MAX_WORKSPACES: usize = 10;
/// Default inactivity period after which a workspace is stale.
pub const DEFAULT_STALE_THRESHOLD_DAYS: u32 = 14;
pub const DEFAULT_SWEEP_INTERVAL_MINUTES: u64 = 60;
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 300;
/// Default quiet period before a `running` run counts as abandoned.
pub const DEFAULT_RUN_GRACE_MINUTES: u64 = 30;
pub const DEFAULT_COMMAND_DIRS: &[&str] = &[".conductor/commands", ".claude/commands"];
pub const DEFAULT_BRANCH: &str = "main";

/// One configuration file (global, workspace or local).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConductorConfig {
    /// Completion provider (only `anthropic` is built in)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Custom base URL for the completion API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workspaces_per_codebase: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_threshold_days: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_minutes: Option<u64>,

    /// Timeout for every git subprocess
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_timeout_secs: Option<u64>,

    /// Timeout for one workflow step's completion call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_grace_minutes: Option<u64>,

    /// Ordered step-prompt directories; replaces the default list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_dirs: Option<Vec<String>>,

    /// Extra auxiliary paths copied into every workspace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_files: Option<Vec<String>>,

    /// Root directory for workspaces
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_base: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub codebases: Option<Vec<CodebaseConfig>>,
}

/// A canonical repository workspaces are cut from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodebaseConfig {
    pub id: String,
    pub repo_path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl CodebaseConfig {
    pub fn new(id: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            repo_path: repo_path.into(),
            default_branch: default_branch(),
        }
    }
}

/// Per-repository settings at `<repo>/.conductor/config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<RepoWorktreeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoWorktreeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_files: Option<Vec<String>>,
}

impl RepoConfig {
    pub fn copy_files(&self) -> &[String] {
        self.worktree
            .as_ref()
            .and_then(|w| w.copy_files.as_deref())
            .unwrap_or(&[])
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_workspaces_per_codebase: usize,
    pub stale_threshold_days: u32,
    pub sweep_interval_minutes: u64,
    pub git_timeout_secs: u64,
    pub completion_timeout_secs: u64,
    pub run_grace_minutes: u64,
    pub command_dirs: Vec<String>,
    pub copy_files: Vec<String>,
    pub worktree_base: PathBuf,
    pub database_path: PathBuf,
    pub codebases: Vec<CodebaseConfig>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        let base = super::loader::get_global_config_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            provider: "anthropic".to_string(),
            model: None,
            base_url: None,
            max_workspaces_per_codebase: DEFAULT_MAX_WORKSPACES,
            stale_threshold_days: DEFAULT_STALE_THRESHOLD_DAYS,
            sweep_interval_minutes: DEFAULT_SWEEP_INTERVAL_MINUTES,
            git_timeout_secs: DEFAULT_GIT_TIMEOUT_SECS,
            completion_timeout_secs: DEFAULT_COMPLETION_TIMEOUT_SECS,
            run_grace_minutes: DEFAULT_RUN_GRACE_MINUTES,
            command_dirs: DEFAULT_COMMAND_DIRS.iter().map(|s| s.to_string()).collect(),
            copy_files: Vec::new(),
            worktree_base: base.join("worktrees"),
            database_path: base.join("conductor.db"),
            codebases: Vec::new(),
        }
    }
}

impl ResolvedConfig {
    pub fn codebase(&self, id: &str) -> Option<&CodebaseConfig> {
        self.codebases.iter().find(|c| c.id == id)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.stale_threshold_days))
    }

    pub fn run_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.run_grace_minutes as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes * 60)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    /// Reject values the rest of the system cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workspaces_per_codebase == 0 {
            return Err(ConfigError::InvalidValue {
                field: "maxWorkspacesPerCodebase".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.sweep_interval_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sweepIntervalMinutes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.git_timeout_secs == 0 || self.completion_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeouts".to_string(),
                message: "timeouts must be non-zero".to_string(),
            });
        }
        for (i, codebase) in self.codebases.iter().enumerate() {
            if codebase.id.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("codebases[{i}].id"),
                    message: "must not be empty".to_string(),
                });
            }
            if self.codebases[..i].iter().any(|c| c.id == codebase.id) {
                return Err(ConfigError::InvalidValue {
                    field: format!("codebases[{i}].id"),
                    message: format!("duplicate codebase id {:?}", codebase.id),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conductor_config_camel_case() {
        let json = r#"{
            "maxWorkspacesPerCodebase": 3,
            "staleThresholdDays": 7,
            "codebases": [{"id": "api", "repoPath": "/srv/api"}]
        }"#;
        let config: ConductorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_workspaces_per_codebase, Some(3));
        assert_eq!(config.stale_threshold_days, Some(7));
        let codebases = config.codebases.unwrap();
        assert_eq!(codebases[0].default_branch, "main");
    }

    #[test]
    fn test_repo_config_yaml() {
        let yaml = "worktree:\n  copyFiles:\n    - .env.test\n    - config/dev.toml -> config/local.toml\n";
        let config: RepoConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.copy_files().len(), 2);
        assert!(RepoConfig::default().copy_files().is_empty());
    }

    #[test]
    fn test_resolved_defaults() {
        let config = ResolvedConfig::default();
        assert_eq!(config.max_workspaces_per_codebase, 10);
        assert_eq!(config.stale_threshold(), chrono::Duration::days(14));
        assert_eq!(config.run_grace(), chrono::Duration::minutes(30));
        assert_eq!(config.command_dirs, vec![".conductor/commands", ".claude/commands"]);
        assert!(config.worktree_base.ends_with("worktrees"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = ResolvedConfig {
            max_workspaces_per_codebase: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(ConfigError::InvalidValue { .. })));

        let dupes = ResolvedConfig {
            codebases: vec![CodebaseConfig::new("api", "/a"), CodebaseConfig::new("api", "/b")],
            ..Default::default()
        };
        let err = dupes.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
