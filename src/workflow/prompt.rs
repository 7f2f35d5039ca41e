// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Step prompt resolution.
//!
//! A step names a command; its prompt lives in `<dir>/<command>.md` in one of
//! an ordered list of directories. Names are validated before any filesystem
//! access so a command can never address a path outside those directories.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::PromptError;

/// Letters, digits, `-` and `_`; must not start with `-` or `_` (or a dot).
static COMMAND_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").unwrap());

/// Values substituted into prompt templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptVariables {
    pub user_message: String,
    pub workflow_id: String,
}

impl PromptVariables {
    pub fn new(user_message: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            workflow_id: workflow_id.into(),
        }
    }
}

/// Whether `name` is a safe command name.
pub fn is_valid_command_name(name: &str) -> bool {
    COMMAND_NAME.is_match(name)
}

/// Replace `$ARGUMENTS`, `$USER_MESSAGE` and `$WORKFLOW_ID`.
pub fn render(template: &str, vars: &PromptVariables) -> String {
    template
        .replace("$ARGUMENTS", &vars.user_message)
        .replace("$USER_MESSAGE", &vars.user_message)
        .replace("$WORKFLOW_ID", &vars.workflow_id)
}

/// Finds command files in an ordered list of directories.
#[derive(Debug, Clone)]
pub struct PromptResolver {
    search_dirs: Vec<PathBuf>,
}

impl PromptResolver {
    /// Relative directories are resolved against the workspace at lookup time.
    pub fn new(search_dirs: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            search_dirs: search_dirs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Candidate directories for a workspace, in search order.
    pub fn candidate_dirs(&self, workspace: &Path) -> Vec<PathBuf> {
        self.search_dirs
            .iter()
            .map(|dir| {
                if dir.is_absolute() {
                    dir.clone()
                } else {
                    workspace.join(dir)
                }
            })
            .collect()
    }

    /// Load the raw template for `name`. The first existing non-empty file wins.
    pub fn load(&self, name: &str, workspace: &Path) -> Result<String, PromptError> {
        if !is_valid_command_name(name) {
            return Err(PromptError::InvalidName(name.to_string()));
        }

        let searched = self.candidate_dirs(workspace);
        let mut first_empty: Option<PathBuf> = None;

        for dir in &searched {
            let path = dir.join(format!("{name}.md"));
            match std::fs::read_to_string(&path) {
                Ok(content) if content.trim().is_empty() => {
                    debug!(path = %path.display(), "Skipping empty command file");
                    first_empty.get_or_insert(path);
                }
                Ok(content) => {
                    debug!(path = %path.display(), "Resolved command file");
                    return Ok(content);
                }
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {}
                Err(e) => {
                    return Err(PromptError::Io {
                        path,
                        message: e.to_string(),
                    })
                }
            }
        }

        match first_empty {
            Some(path) => Err(PromptError::EmptyFile(path)),
            None => Err(PromptError::NotFound {
                name: name.to_string(),
                searched,
            }),
        }
    }

    /// Load and render the prompt for `name`.
    pub fn resolve(
        &self,
        name: &str,
        workspace: &Path,
        vars: &PromptVariables,
    ) -> Result<String, PromptError> {
        self.load(name, workspace).map(|template| render(&template, vars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_command_name_validation() {
        assert!(is_valid_command_name("plan"));
        assert!(is_valid_command_name("fix-issue_2"));
        assert!(!is_valid_command_name(".hidden"));
        assert!(!is_valid_command_name("../etc/passwd"));
        assert!(!is_valid_command_name("a/b"));
        assert!(!is_valid_command_name("a\\b"));
        assert!(!is_valid_command_name("-flag"));
        assert!(!is_valid_command_name(""));
    }

    #[test]
    fn test_invalid_name_never_touches_disk() {
        let resolver = PromptResolver::new(["/definitely/not/here"]);
        let err = resolver.load("../secret", Path::new("/ws")).unwrap_err();
        assert_eq!(err, PromptError::InvalidName("../secret".to_string()));
    }

    #[test]
    fn test_first_non_empty_file_wins() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join(".conductor/commands");
        let second = temp.path().join(".claude/commands");
        write(&first, "plan.md", "   \n");
        write(&second, "plan.md", "Plan $ARGUMENTS for $WORKFLOW_ID");

        let resolver = PromptResolver::new([".conductor/commands", ".claude/commands"]);
        let vars = PromptVariables::new("the fix", "issue-42");
        let prompt = resolver.resolve("plan", temp.path(), &vars).unwrap();
        assert_eq!(prompt, "Plan the fix for issue-42");
    }

    #[test]
    fn test_empty_file_is_distinct_from_missing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("commands");
        write(&dir, "plan.md", "");

        let resolver = PromptResolver::new(["commands"]);
        assert_eq!(
            resolver.load("plan", temp.path()).unwrap_err(),
            PromptError::EmptyFile(dir.join("plan.md"))
        );

        match resolver.load("review", temp.path()).unwrap_err() {
            PromptError::NotFound { name, searched } => {
                assert_eq!(name, "review");
                assert_eq!(searched, vec![dir]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_absolute_dirs_are_used_as_is() {
        let shared = TempDir::new().unwrap();
        write(shared.path(), "ship.md", "Ship it: $USER_MESSAGE");

        let resolver = PromptResolver::new([PathBuf::from("local"), shared.path().to_path_buf()]);
        let prompt = resolver
            .resolve("ship", Path::new("/nonexistent/ws"), &PromptVariables::new("now", "1"))
            .unwrap();
        assert_eq!(prompt, "Ship it: now");
    }
}
