// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared helpers for tests that drive a real `git` binary.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Whether a usable `git` is on PATH. Tests that need it return early otherwise.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run git in `dir` with a fixed identity, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=Conductor Tests",
            "-c",
            "user.email=tests@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn commit_file(dir: &Path, name: &str, content: &str) -> String {
    std::fs::write(dir.join(name), content).expect("write file");
    git(dir, &["add", name]);
    git(dir, &["commit", "-q", "-m", &format!("update {name}")]);
    git(dir, &["rev-parse", "HEAD"])
}

/// A temp dir holding `repo/` (a git repository on `main` with one commit)
/// and an empty `worktrees/` base.
pub struct GitSandbox {
    pub temp: TempDir,
    pub repo: PathBuf,
    pub worktrees: PathBuf,
}

impl GitSandbox {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("temp dir");
        let repo = temp.path().join("repo");
        let worktrees = temp.path().join("worktrees");
        std::fs::create_dir_all(&repo).expect("create repo dir");
        git(&repo, &["init", "-q"]);
        git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        commit_file(&repo, "README.md", "# sandbox\n");
        Self {
            temp,
            repo,
            worktrees,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        !git(&self.repo, &["branch", "--list", branch]).is_empty()
    }

    pub fn main_head(&self) -> String {
        git(&self.repo, &["rev-parse", "main"])
    }
}
