// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Test doubles shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{GitError, GitFailureKind, NotifyError, ProviderError, StoreError};
use crate::store::{SqliteStore, Store};
use crate::types::{
    CompletionClient, CompletionEvent, CompletionRequest, CompletionResponse, EventCallback,
    TokenUsage,
};
use crate::workflow::{NewRunEvent, NewWorkflowRun, Notifier, RunEvent, RunStatus, WorkflowRun};
use crate::workspace::{Vcs, WorkflowType, Workspace, WorkspaceStatus};

// ============================================================================
// FakeVcs
// ============================================================================

/// Commit every new branch starts at.
pub const BASE_SHA: &str = "base000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    AddWorktree {
        target: PathBuf,
        branch: String,
        base_ref: Option<String>,
    },
    RemoveWorktree {
        target: PathBuf,
        force: bool,
    },
    DeleteBranch {
        branch: String,
        force: bool,
    },
    Prune,
    FetchRef {
        refspec: String,
    },
    RevParse {
        rev: String,
    },
    IsAncestor {
        ancestor: String,
        descendant: String,
    },
    Status {
        dir: PathBuf,
    },
}

#[derive(Default)]
struct FakeVcsState {
    calls: Vec<VcsCall>,
    /// Branch name to tip commit.
    branches: HashMap<String, String>,
    /// Worktree directory to branch.
    worktrees: HashMap<PathBuf, String>,
    merged: HashSet<String>,
    dirty: HashSet<PathBuf>,
    fail_add: Option<GitFailureKind>,
    fail_remove: Option<GitFailureKind>,
    fail_delete: Option<GitFailureKind>,
}

/// In-memory git that lays out real worktree directories on disk.
#[derive(Default)]
pub struct FakeVcs {
    state: Mutex<FakeVcsState>,
}

fn git_failure(command: &str, kind: GitFailureKind) -> GitError {
    GitError::Failed {
        command: command.to_string(),
        kind,
        stderr: format!("fake {command} failure: {kind}"),
    }
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&VcsCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn add_branch(&self, branch: &str) {
        self.state
            .lock()
            .branches
            .insert(branch.to_string(), BASE_SHA.to_string());
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state.lock().branches.contains_key(branch)
    }

    pub fn advance_branch(&self, branch: &str, sha: &str) {
        self.state
            .lock()
            .branches
            .insert(branch.to_string(), sha.to_string());
    }

    pub fn mark_merged(&self, sha: &str) {
        self.state.lock().merged.insert(sha.to_string());
    }

    pub fn set_dirty(&self, dir: &Path) {
        self.state.lock().dirty.insert(dir.to_path_buf());
    }

    pub fn fail_next_add(&self, kind: GitFailureKind) {
        self.state.lock().fail_add = Some(kind);
    }

    pub fn fail_next_remove(&self, kind: GitFailureKind) {
        self.state.lock().fail_remove = Some(kind);
    }

    pub fn fail_next_delete_branch(&self, kind: GitFailureKind) {
        self.state.lock().fail_delete = Some(kind);
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn add_worktree(
        &self,
        repo: &Path,
        target: &Path,
        branch: &str,
        base_ref: Option<&str>,
    ) -> Result<(), GitError> {
        let mut state = self.state.lock();
        state.calls.push(VcsCall::AddWorktree {
            target: target.to_path_buf(),
            branch: branch.to_string(),
            base_ref: base_ref.map(str::to_string),
        });
        if let Some(kind) = state.fail_add.take() {
            return Err(git_failure("worktree add", kind));
        }
        if state.branches.contains_key(branch) {
            return Err(git_failure("worktree add", GitFailureKind::AlreadyExists));
        }

        let admin = repo.join(".git").join("worktrees").join(branch.replace('/', "-"));
        std::fs::create_dir_all(&admin).map_err(|e| GitError::Spawn(e.to_string()))?;
        std::fs::create_dir_all(target).map_err(|e| GitError::Spawn(e.to_string()))?;
        std::fs::write(target.join(".git"), format!("gitdir: {}\n", admin.display()))
            .map_err(|e| GitError::Spawn(e.to_string()))?;

        state.branches.insert(branch.to_string(), BASE_SHA.to_string());
        state.worktrees.insert(target.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn remove_worktree(&self, _repo: &Path, target: &Path, force: bool) -> Result<(), GitError> {
        let mut state = self.state.lock();
        state.calls.push(VcsCall::RemoveWorktree {
            target: target.to_path_buf(),
            force,
        });
        if let Some(kind) = state.fail_remove.take() {
            return Err(git_failure("worktree remove", kind));
        }
        if state.worktrees.remove(target).is_none() || !target.exists() {
            return Err(git_failure("worktree remove", GitFailureKind::NotAWorktree));
        }
        let _ = std::fs::remove_dir_all(target);
        Ok(())
    }

    async fn delete_branch(&self, _repo: &Path, branch: &str, force: bool) -> Result<(), GitError> {
        let mut state = self.state.lock();
        state.calls.push(VcsCall::DeleteBranch {
            branch: branch.to_string(),
            force,
        });
        if let Some(kind) = state.fail_delete.take() {
            return Err(git_failure("branch -D", kind));
        }
        match state.branches.remove(branch) {
            Some(_) => Ok(()),
            None => Err(git_failure("branch -D", GitFailureKind::Other)),
        }
    }

    async fn prune_worktrees(&self, _repo: &Path) -> Result<(), GitError> {
        let mut state = self.state.lock();
        state.calls.push(VcsCall::Prune);
        state.worktrees.retain(|path, _| path.exists());
        Ok(())
    }

    async fn fetch_ref(&self, _repo: &Path, _remote: &str, refspec: &str) -> Result<(), GitError> {
        self.state.lock().calls.push(VcsCall::FetchRef {
            refspec: refspec.to_string(),
        });
        Ok(())
    }

    async fn rev_parse(&self, dir: &Path, rev: &str) -> Result<String, GitError> {
        let mut state = self.state.lock();
        state.calls.push(VcsCall::RevParse {
            rev: rev.to_string(),
        });
        let branch = if rev == "HEAD" {
            state.worktrees.get(dir).cloned()
        } else {
            Some(rev.strip_prefix("refs/heads/").unwrap_or(rev).to_string())
        };
        branch
            .and_then(|b| state.branches.get(&b).cloned())
            .ok_or_else(|| git_failure("rev-parse --verify", GitFailureKind::Other))
    }

    async fn is_ancestor(&self, _repo: &Path, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let mut state = self.state.lock();
        state.calls.push(VcsCall::IsAncestor {
            ancestor: ancestor.to_string(),
            descendant: descendant.to_string(),
        });
        Ok(state.merged.contains(ancestor))
    }

    async fn has_uncommitted_changes(&self, dir: &Path) -> Result<bool, GitError> {
        let mut state = self.state.lock();
        state.calls.push(VcsCall::Status {
            dir: dir.to_path_buf(),
        });
        Ok(state.dirty.contains(dir))
    }
}

/// Push a directory's modification time `days` into the past.
pub fn age_directory(path: &Path, days: i64) {
    let when = std::time::SystemTime::now() - Duration::from_secs(days as u64 * 24 * 60 * 60);
    std::fs::File::open(path).unwrap().set_modified(when).unwrap();
}

// ============================================================================
// ScriptedClient
// ============================================================================

/// One scripted completion response.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    /// Reply after a delay.
    Delay(Duration, String),
    Fail(ProviderError),
    /// Never answer.
    Hang,
    Panic(String),
}

/// Completion client that plays back a script, then replies "done".
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn stream_query(
        &self,
        request: CompletionRequest,
        on_event: EventCallback,
    ) -> Result<CompletionResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request);
        let next = self.script.lock().pop_front();

        let text = match next {
            None => "done".to_string(),
            Some(Scripted::Reply(text)) => text,
            Some(Scripted::Delay(delay, text)) => {
                tokio::time::sleep(delay).await;
                text
            }
            Some(Scripted::Fail(error)) => return Err(error),
            Some(Scripted::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(ProviderError::StreamError("hang ended".to_string()));
            }
            Some(Scripted::Panic(message)) => panic!("{message}"),
        };

        let session_id = format!("sess-{n}");
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        };
        on_event(CompletionEvent::Text(text.clone()));
        on_event(CompletionEvent::Result {
            session_id: session_id.clone(),
            usage: Some(usage),
        });
        Ok(CompletionResponse {
            text,
            session_id,
            tool_uses: 0,
            usage: Some(usage),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// RecordingNotifier
// ============================================================================

/// Records every message; optionally fails every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }

    pub fn texts_for(&self, conversation_id: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(c, _)| c == conversation_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn contains(&self, conversation_id: &str, needle: &str) -> bool {
        self.texts_for(conversation_id).iter().any(|t| t.contains(needle))
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NotifyError::Delivery("sink unavailable".to_string()));
        }
        self.messages
            .lock()
            .push((conversation_id.to_string(), text.to_string()));
        Ok(())
    }
}

// ============================================================================
// CountingStore
// ============================================================================

/// [`SqliteStore`] that counts calls to the run-creating operations.
pub struct CountingStore {
    inner: SqliteStore,
    create_run: AtomicUsize,
    destroyed_updates: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            create_run: AtomicUsize::new(0),
            destroyed_updates: AtomicUsize::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(SqliteStore::open_in_memory().unwrap())
    }

    pub fn create_run_calls(&self) -> usize {
        self.create_run.load(Ordering::SeqCst)
    }

    pub fn destroyed_updates(&self) -> usize {
        self.destroyed_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn get_active_run(&self, conversation_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        self.inner.get_active_run(conversation_id).await
    }

    async fn create_run(&self, run: NewWorkflowRun) -> Result<WorkflowRun, StoreError> {
        self.create_run.fetch_add(1, Ordering::SeqCst);
        self.inner.create_run(run).await
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<WorkflowRun, StoreError> {
        self.inner.update_run_status(run_id, status, error).await
    }

    async fn update_run_step(&self, run_id: &str, step_index: usize) -> Result<(), StoreError> {
        self.inner.update_run_step(run_id, step_index).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(
        &self,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        self.inner.list_runs(conversation_id, limit).await
    }

    async fn list_running_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        self.inner.list_running_runs().await
    }

    async fn append_run_event(&self, event: NewRunEvent) -> Result<RunEvent, StoreError> {
        self.inner.append_run_event(event).await
    }

    async fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>, StoreError> {
        self.inner.list_run_events(run_id).await
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, StoreError> {
        self.inner.get_workspace(workspace_id).await
    }

    async fn find_workspace(
        &self,
        codebase_id: &str,
        workflow_type: WorkflowType,
        workflow_id: &str,
    ) -> Result<Option<Workspace>, StoreError> {
        self.inner
            .find_workspace(codebase_id, workflow_type, workflow_id)
            .await
    }

    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), StoreError> {
        self.inner.create_workspace(workspace).await
    }

    async fn update_workspace_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
    ) -> Result<(), StoreError> {
        if status == WorkspaceStatus::Destroyed {
            self.destroyed_updates.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.update_workspace_status(workspace_id, status).await
    }

    async fn touch_workspace(&self, workspace_id: &str) -> Result<(), StoreError> {
        self.inner.touch_workspace(workspace_id).await
    }

    async fn count_active_workspaces(&self, codebase_id: &str) -> Result<usize, StoreError> {
        self.inner.count_active_workspaces(codebase_id).await
    }

    async fn list_active_workspaces(
        &self,
        codebase_id: Option<&str>,
    ) -> Result<Vec<Workspace>, StoreError> {
        self.inner.list_active_workspaces(codebase_id).await
    }
}
