// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Copying untracked auxiliary files into a fresh workspace.
//!
//! A worktree only contains tracked files, so things like `.env` have to be
//! copied over from the canonical repository. Entries are paths relative to
//! the repository root and may take three forms:
//!
//! ```text
//! .env                              # file, same relative path
//! config/dev.toml -> config/local.toml   # file or directory, renamed
//! fixtures/**/*.local.json          # glob, each match at its own path
//! ```
//!
//! Directories are copied recursively. Absolute paths and `..` components are
//! rejected. Nothing here ever fails the caller: every problem is recorded in
//! the returned [`CopyReport`].

use std::path::{Component, Path, PathBuf};

use globset::Glob;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::types::CopyReport;

/// Files copied into every workspace when present.
pub const DEFAULT_AUX_FILES: &[&str] = &[".env", ".env.local"];

/// Directories never descended into while expanding globs.
const GLOB_SKIP_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// One parsed copy entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Parse `"src"` or `"src -> dest"`.
pub fn parse_entry(entry: &str) -> Result<CopySpec, String> {
    let (source, dest) = match entry.split_once("->") {
        Some((s, d)) => (s.trim(), d.trim()),
        None => (entry.trim(), entry.trim()),
    };
    if source.is_empty() || dest.is_empty() {
        return Err("empty path".to_string());
    }
    Ok(CopySpec {
        source: safe_relative(source)?,
        dest: safe_relative(dest)?,
    })
}

/// Accept only plain relative paths that stay inside their root.
fn safe_relative(raw: &str) -> Result<PathBuf, String> {
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(format!("{raw}: '..' is not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("{raw}: absolute paths are not allowed"))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(format!("{raw}: empty path"));
    }
    Ok(clean)
}

fn is_glob(entry: &str) -> bool {
    entry.contains(['*', '?', '[', '{'])
}

/// Copy the default set plus `extra` entries from `repo` into `workspace`.
pub fn copy_auxiliary_files(repo: &Path, workspace: &Path, extra: &[String]) -> CopyReport {
    let mut report = CopyReport::default();
    let mut seen = Vec::new();

    let entries = DEFAULT_AUX_FILES
        .iter()
        .map(|s| s.to_string())
        .chain(extra.iter().cloned());

    for entry in entries {
        if seen.contains(&entry) {
            continue;
        }
        seen.push(entry.clone());

        if is_glob(&entry) {
            copy_glob(repo, workspace, &entry, &mut report);
            continue;
        }

        let spec = match parse_entry(&entry) {
            Ok(spec) => spec,
            Err(reason) => {
                warn!(entry = %entry, %reason, "Rejected auxiliary file entry");
                report.failed.push((entry, reason));
                continue;
            }
        };

        let source = repo.join(&spec.source);
        if !source.exists() {
            debug!(entry = %entry, "Auxiliary file not present in repository");
            report.missing.push(entry);
            continue;
        }

        let result = if source.is_dir() {
            copy_dir(&source, &workspace.join(&spec.dest), &mut report.copied)
        } else {
            copy_file(&source, &workspace.join(&spec.dest), &mut report.copied)
        };
        if let Err(e) = result {
            warn!(entry = %entry, error = %e, "Failed to copy auxiliary file");
            report.failed.push((entry, e.to_string()));
        }
    }

    report
}

fn copy_glob(repo: &Path, workspace: &Path, pattern: &str, report: &mut CopyReport) {
    if let Err(reason) = safe_relative(pattern) {
        report.failed.push((pattern.to_string(), reason));
        return;
    }
    let matcher = match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher(),
        Err(e) => {
            report.failed.push((pattern.to_string(), e.to_string()));
            return;
        }
    };

    let mut matched = false;
    let walker = WalkDir::new(repo).into_iter().filter_entry(|e| {
        !(e.file_type().is_dir()
            && e.file_name()
                .to_str()
                .is_some_and(|name| GLOB_SKIP_DIRS.contains(&name)))
    });

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(repo) else {
            continue;
        };
        if !matcher.is_match(relative) {
            continue;
        }
        matched = true;
        if let Err(e) = copy_file(entry.path(), &workspace.join(relative), &mut report.copied) {
            report
                .failed
                .push((relative.display().to_string(), e.to_string()));
        }
    }

    if !matched {
        report.missing.push(pattern.to_string());
    }
}

fn copy_file(source: &Path, dest: &Path, copied: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, dest)?;
    copied.push(dest.to_path_buf());
    Ok(())
}

fn copy_dir(source: &Path, dest: &Path, copied: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            copy_file(entry.path(), &target, copied)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        let ws = temp.path().join("ws");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::create_dir_all(&ws).unwrap();
        (temp, repo, ws)
    }

    #[test]
    fn test_parse_entry() {
        let plain = parse_entry(".env").unwrap();
        assert_eq!(plain.source, plain.dest);

        let renamed = parse_entry("config/dev.toml -> config/local.toml").unwrap();
        assert_eq!(renamed.source, PathBuf::from("config/dev.toml"));
        assert_eq!(renamed.dest, PathBuf::from("config/local.toml"));

        assert!(parse_entry("../secrets").is_err());
        assert!(parse_entry("/etc/passwd").is_err());
        assert!(parse_entry("a -> ../../b").is_err());
        assert!(parse_entry(" -> b").is_err());
    }

    #[test]
    fn test_copies_defaults_and_reports_missing() {
        let (_temp, repo, ws) = setup();
        std::fs::write(repo.join(".env"), "KEY=1").unwrap();

        let report = copy_auxiliary_files(&repo, &ws, &[]);

        assert_eq!(std::fs::read_to_string(ws.join(".env")).unwrap(), "KEY=1");
        assert_eq!(report.copied, vec![ws.join(".env")]);
        assert_eq!(report.missing, vec![".env.local".to_string()]);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_rename_and_directory_copy() {
        let (_temp, repo, ws) = setup();
        std::fs::create_dir_all(repo.join("certs/dev")).unwrap();
        std::fs::write(repo.join("certs/dev/key.pem"), "k").unwrap();
        std::fs::write(repo.join("dev.toml"), "x").unwrap();

        let extra = vec!["certs".to_string(), "dev.toml -> config/local.toml".to_string()];
        let report = copy_auxiliary_files(&repo, &ws, &extra);

        assert!(ws.join("certs/dev/key.pem").exists());
        assert!(ws.join("config/local.toml").exists());
        assert_eq!(report.copied.len(), 2);
    }

    #[test]
    fn test_glob_entries() {
        let (_temp, repo, ws) = setup();
        std::fs::create_dir_all(repo.join("apps/web")).unwrap();
        std::fs::create_dir_all(repo.join("node_modules/pkg")).unwrap();
        std::fs::write(repo.join("apps/web/.env.dev"), "a").unwrap();
        std::fs::write(repo.join("node_modules/pkg/.env.dev"), "b").unwrap();

        let report = copy_auxiliary_files(&repo, &ws, &["apps/**/.env.dev".to_string(), "**/*.nope".to_string()]);

        assert!(ws.join("apps/web/.env.dev").exists());
        assert!(!ws.join("node_modules").exists());
        assert!(report.missing.contains(&"**/*.nope".to_string()));
    }

    #[test]
    fn test_traversal_is_recorded_not_fatal() {
        let (_temp, repo, ws) = setup();
        let report = copy_auxiliary_files(&repo, &ws, &["../outside".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains(".."));
    }
}
