// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in various locations.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::{ConductorConfig, RepoConfig};

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[".conductor.json", ".conductor/config.json", "conductor.config.json"];

/// Local config file name (for per-directory overrides).
pub const LOCAL_CONFIG_FILE: &str = ".conductor.local.json";

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".conductor";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Per-repository config files, relative to the repository root.
pub const REPO_CONFIG_FILES: &[&str] = &[
    ".conductor/config.yaml",
    ".conductor/config.yml",
    ".conductor/config.json",
];

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.conductor/config.json.
pub fn load_global_config() -> Result<Option<ConductorConfig>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load workspace configuration from the first matching file in [`CONFIG_FILES`].
pub fn load_workspace_config(root: &Path) -> Result<Option<ConductorConfig>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load local configuration from .conductor.local.json.
pub fn load_local_config(root: &Path) -> Result<Option<ConductorConfig>, ConfigError> {
    let path = root.join(LOCAL_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<ConductorConfig, ConfigError> {
    parse_file(path)
}

/// Load the per-repository config of a canonical repository, if any.
pub fn load_repo_config(repo_path: &Path) -> Result<Option<RepoConfig>, ConfigError> {
    for filename in REPO_CONFIG_FILES {
        let path = repo_path.join(filename);
        if path.exists() {
            return parse_file(&path).map(Some);
        }
    }
    Ok(None)
}

fn parse_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Find the directory holding a config file, walking up from `start`.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        if CONFIG_FILES.iter().any(|f| current.join(f).exists()) {
            return Some(current);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir().unwrap();
        assert!(dir.ends_with(".conductor"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        assert!(load_workspace_config(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_workspace_config_order() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".conductor")).unwrap();
        std::fs::write(
            temp.path().join(".conductor/config.json"),
            r#"{"maxWorkspacesPerCodebase": 4}"#,
        )
        .unwrap();
        std::fs::write(
            temp.path().join(".conductor.json"),
            r#"{"maxWorkspacesPerCodebase": 2}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.max_workspaces_per_codebase, Some(2));
    }

    #[test]
    fn test_load_local_config() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(LOCAL_CONFIG_FILE), r#"{"staleThresholdDays": 1}"#).unwrap();
        let config = load_local_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.stale_threshold_days, Some(1));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".conductor.json"), "{not json").unwrap();
        assert!(matches!(
            load_workspace_config(temp.path()),
            Err(ConfigError::JsonError(_))
        ));
    }

    #[test]
    fn test_load_repo_config_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".conductor")).unwrap();
        std::fs::write(
            temp.path().join(".conductor/config.yaml"),
            "worktree:\n  copyFiles: [\".env.test\"]\n",
        )
        .unwrap();

        let repo = load_repo_config(temp.path()).unwrap().unwrap();
        assert_eq!(repo.copy_files(), [".env.test".to_string()]);
    }

    #[test]
    fn test_find_workspace_root() {
        let temp = TempDir::new().unwrap();
        let subdir = temp.path().join("a").join("b");
        std::fs::create_dir_all(&subdir).unwrap();
        std::fs::write(temp.path().join(".conductor.json"), "{}").unwrap();

        assert_eq!(find_workspace_root(&subdir).unwrap(), temp.path());
    }
}
