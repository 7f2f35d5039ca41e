// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-backed store.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::error::StoreError;
use crate::workflow::{NewRunEvent, NewWorkflowRun, RunEvent, RunStatus, WorkflowRun};
use crate::workspace::{WorkflowType, Workspace, WorkspaceStatus};

use super::Store;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 2;

const RUN_COLUMNS: &str = "id, workflow_name, conversation_id, codebase_id, workspace_id, status, \
     current_step_index, user_message, metadata, error, started_at, completed_at, last_activity_at";

const WORKSPACE_COLUMNS: &str = "id, path, branch_name, codebase_id, conversation_id, status, \
     workflow_type, workflow_id, base_commit, created_at, last_activity_at";

/// [`Store`] on a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create a database at `db_path`.
    pub fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        Self::init(conn, Some(db_path.to_path_buf()))
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn, None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Earlier, destroyed records for a workspace path, oldest first.
    pub async fn workspace_history(&self, workspace_id: &str) -> Result<Vec<Workspace>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspace_history WHERE id = ?1 ORDER BY row_id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workspace_id], row_to_workspace)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS workspaces (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            branch_name TEXT NOT NULL,
            codebase_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            status TEXT NOT NULL,
            workflow_type TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            base_commit TEXT,
            created_at INTEGER NOT NULL,
            last_activity_at INTEGER NOT NULL
        );

        -- Destroyed records, archived when their path is allocated again.
        CREATE TABLE IF NOT EXISTS workspace_history (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL,
            path TEXT NOT NULL,
            branch_name TEXT NOT NULL,
            codebase_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            status TEXT NOT NULL,
            workflow_type TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            base_commit TEXT,
            created_at INTEGER NOT NULL,
            last_activity_at INTEGER NOT NULL,
            archived_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_runs (
            id TEXT PRIMARY KEY,
            workflow_name TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            codebase_id TEXT NOT NULL,
            workspace_id TEXT,
            status TEXT NOT NULL,
            current_step_index INTEGER NOT NULL DEFAULT 0,
            user_message TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT 'null',
            error TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            last_activity_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_run_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            step_index INTEGER NOT NULL,
            kind TEXT NOT NULL,
            command TEXT NOT NULL,
            detail TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (run_id) REFERENCES workflow_runs(id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_running
            ON workflow_runs(conversation_id) WHERE status = 'running';
        CREATE INDEX IF NOT EXISTS idx_runs_conversation
            ON workflow_runs(conversation_id, started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_workspaces_codebase_status
            ON workspaces(codebase_id, status);
        CREATE INDEX IF NOT EXISTS idx_workspaces_workflow
            ON workspaces(codebase_id, workflow_type, workflow_id);
        CREATE INDEX IF NOT EXISTS idx_workspace_history_id
            ON workspace_history(id, row_id);
        CREATE INDEX IF NOT EXISTS idx_run_events_run
            ON workflow_run_events(run_id, id);
        "#,
    )?;

    let current: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match current {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(StoreError::Corrupted(format!(
                "database schema version {v} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        Some(v) if v < SCHEMA_VERSION => {
            // Older versions only lack tables created above.
            conn.execute("UPDATE schema_version SET version = ?1", params![SCHEMA_VERSION])?;
        }
        Some(_) => {}
    }
    Ok(())
}

fn record(operation: &'static str, start: Instant) {
    #[cfg(feature = "telemetry")]
    GLOBAL_METRICS.record_operation(operation, start.elapsed());
    #[cfg(not(feature = "telemetry"))]
    let _ = (operation, start);
}

// ============================================================================
// Row conversion
// ============================================================================

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_column<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {millis}")))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => timestamp(row, idx).map(Some),
        None => Ok(None),
    }
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    let metadata: String = row.get(8)?;
    Ok(WorkflowRun {
        id: row.get(0)?,
        workflow_name: row.get(1)?,
        conversation_id: row.get(2)?,
        codebase_id: row.get(3)?,
        workspace_id: row.get(4)?,
        status: parse_column(row, 5)?,
        current_step_index: row.get::<_, i64>(6)? as usize,
        user_message: row.get(7)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(8, e.to_string()))?,
        error: row.get(9)?,
        started_at: timestamp(row, 10)?,
        completed_at: optional_timestamp(row, 11)?,
        last_activity_at: timestamp(row, 12)?,
    })
}

fn row_to_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    let path: String = row.get(1)?;
    Ok(Workspace {
        id: row.get(0)?,
        path: PathBuf::from(path),
        branch_name: row.get(2)?,
        codebase_id: row.get(3)?,
        conversation_id: row.get(4)?,
        status: parse_column(row, 5)?,
        workflow_type: parse_column(row, 6)?,
        workflow_id: row.get(7)?,
        base_commit: row.get(8)?,
        created_at: timestamp(row, 9)?,
        last_activity_at: timestamp(row, 10)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<RunEvent> {
    Ok(RunEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_index: row.get::<_, i64>(2)? as usize,
        kind: parse_column(row, 3)?,
        command: row.get(4)?,
        detail: row.get(5)?,
        created_at: timestamp(row, 6)?,
    })
}

fn fetch_run(conn: &Connection, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?1");
    Ok(conn.query_row(&sql, params![run_id], row_to_run).optional()?)
}

fn fetch_workspace(conn: &Connection, workspace_id: &str) -> Result<Option<Workspace>, StoreError> {
    let sql = format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![workspace_id], row_to_workspace)
        .optional()?)
}

/// Explain why a guarded run update touched no rows.
fn run_update_error(conn: &Connection, run_id: &str, to: RunStatus) -> StoreError {
    match fetch_run(conn, run_id) {
        Ok(Some(run)) => StoreError::InvalidTransition {
            id: run_id.to_string(),
            from: run.status.to_string(),
            to: to.to_string(),
        },
        Ok(None) => StoreError::NotFound(format!("run {run_id}")),
        Err(e) => e,
    }
}

// ============================================================================
// Store implementation
// ============================================================================

#[async_trait]
impl Store for SqliteStore {
    async fn get_active_run(&self, conversation_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE conversation_id = ?1 AND status = 'running'"
        );
        Ok(conn
            .query_row(&sql, params![conversation_id], row_to_run)
            .optional()?)
    }

    async fn create_run(&self, run: NewWorkflowRun) -> Result<WorkflowRun, StoreError> {
        let start = Instant::now();
        let now = Utc::now();
        let record_run = WorkflowRun {
            id: Uuid::new_v4().to_string(),
            workflow_name: run.workflow_name,
            conversation_id: run.conversation_id,
            codebase_id: run.codebase_id,
            workspace_id: run.workspace_id,
            status: RunStatus::Running,
            current_step_index: 0,
            user_message: run.user_message,
            metadata: run.metadata,
            error: None,
            started_at: now,
            completed_at: None,
            last_activity_at: now,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO workflow_runs ({RUN_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                record_run.id,
                record_run.workflow_name,
                record_run.conversation_id,
                record_run.codebase_id,
                record_run.workspace_id,
                record_run.status.as_str(),
                0i64,
                record_run.user_message,
                record_run.metadata.to_string(),
                record_run.error,
                now.timestamp_millis(),
                Option::<i64>::None,
                now.timestamp_millis(),
            ],
        )
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!(
                "conversation {} already has a running run",
                record_run.conversation_id
            )),
            other => other,
        })?;

        record("store.create_run", start);
        Ok(record_run)
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<WorkflowRun, StoreError> {
        let conn = self.conn.lock().await;
        if !status.is_terminal() {
            return Err(run_update_error(&conn, run_id, status));
        }

        let now = Utc::now().timestamp_millis();
        let changed = conn.execute(
            "UPDATE workflow_runs SET status = ?1, error = ?2, completed_at = ?3, last_activity_at = ?3 \
             WHERE id = ?4 AND status = 'running'",
            params![status.as_str(), error, now, run_id],
        )?;
        if changed == 0 {
            return Err(run_update_error(&conn, run_id, status));
        }

        fetch_run(&conn, run_id)?.ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
    }

    async fn update_run_step(&self, run_id: &str, step_index: usize) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE workflow_runs SET current_step_index = ?1, last_activity_at = ?2 \
             WHERE id = ?3 AND status = 'running'",
            params![step_index as i64, Utc::now().timestamp_millis(), run_id],
        )?;
        if changed == 0 {
            return Err(run_update_error(&conn, run_id, RunStatus::Running));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let conn = self.conn.lock().await;
        fetch_run(&conn, run_id)
    }

    async fn list_runs(
        &self,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs \
             WHERE (?1 IS NULL OR conversation_id = ?1) \
             ORDER BY started_at DESC, rowid DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id, limit as i64], row_to_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_running_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE status = 'running' ORDER BY started_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn append_run_event(&self, event: NewRunEvent) -> Result<RunEvent, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO workflow_run_events (run_id, step_index, kind, command, detail, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.run_id,
                event.step_index as i64,
                event.kind.as_str(),
                event.command,
                event.detail,
                now.timestamp_millis(),
            ],
        )?;
        Ok(RunEvent {
            id: conn.last_insert_rowid(),
            run_id: event.run_id,
            step_index: event.step_index,
            kind: event.kind,
            command: event.command,
            detail: event.detail,
            created_at: now,
        })
    }

    async fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, step_index, kind, command, detail, created_at \
             FROM workflow_run_events WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, StoreError> {
        let conn = self.conn.lock().await;
        fetch_workspace(&conn, workspace_id)
    }

    async fn find_workspace(
        &self,
        codebase_id: &str,
        workflow_type: WorkflowType,
        workflow_id: &str,
    ) -> Result<Option<Workspace>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces \
             WHERE codebase_id = ?1 AND workflow_type = ?2 AND workflow_id = ?3 \
             AND status != 'destroyed' ORDER BY created_at DESC LIMIT 1"
        );
        Ok(conn
            .query_row(
                &sql,
                params![codebase_id, workflow_type.as_str(), workflow_id],
                row_to_workspace,
            )
            .optional()?)
    }

    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), StoreError> {
        let start = Instant::now();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO workspace_history ({WORKSPACE_COLUMNS}, archived_at) \
                 SELECT {WORKSPACE_COLUMNS}, ?2 FROM workspaces \
                 WHERE id = ?1 AND status = 'destroyed'"
            ),
            params![workspace.id, Utc::now().timestamp_millis()],
        )?;
        let changed = tx.execute(
            &format!(
                "INSERT INTO workspaces ({WORKSPACE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(id) DO UPDATE SET \
                    path = excluded.path, \
                    branch_name = excluded.branch_name, \
                    codebase_id = excluded.codebase_id, \
                    conversation_id = excluded.conversation_id, \
                    status = excluded.status, \
                    workflow_type = excluded.workflow_type, \
                    workflow_id = excluded.workflow_id, \
                    base_commit = excluded.base_commit, \
                    created_at = excluded.created_at, \
                    last_activity_at = excluded.last_activity_at \
                 WHERE workspaces.status = 'destroyed'"
            ),
            params![
                workspace.id,
                workspace.path.to_string_lossy(),
                workspace.branch_name,
                workspace.codebase_id,
                workspace.conversation_id,
                workspace.status.as_str(),
                workspace.workflow_type.as_str(),
                workspace.workflow_id,
                workspace.base_commit,
                workspace.created_at.timestamp_millis(),
                workspace.last_activity_at.timestamp_millis(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "live workspace already recorded at {}",
                workspace.id
            )));
        }
        tx.commit()?;
        record("store.create_workspace", start);
        Ok(())
    }

    async fn update_workspace_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let allowed: Vec<String> = status
            .predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect();

        let changed = if allowed.is_empty() {
            0
        } else {
            conn.execute(
                &format!(
                    "UPDATE workspaces SET status = ?1 WHERE id = ?2 AND status IN ({})",
                    allowed.join(", ")
                ),
                params![status.as_str(), workspace_id],
            )?
        };
        if changed > 0 {
            return Ok(());
        }

        match fetch_workspace(&conn, workspace_id)? {
            None => Err(StoreError::NotFound(format!("workspace {workspace_id}"))),
            Some(current) if current.status == status => Ok(()),
            Some(current) => Err(StoreError::InvalidTransition {
                id: workspace_id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            }),
        }
    }

    async fn touch_workspace(&self, workspace_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE workspaces SET last_activity_at = ?1 WHERE id = ?2",
            params![Utc::now().timestamp_millis(), workspace_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("workspace {workspace_id}")));
        }
        Ok(())
    }

    async fn count_active_workspaces(&self, codebase_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workspaces WHERE codebase_id = ?1 AND status != 'destroyed'",
            params![codebase_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn list_active_workspaces(
        &self,
        codebase_id: Option<&str>,
    ) -> Result<Vec<Workspace>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces \
             WHERE status != 'destroyed' AND (?1 IS NULL OR codebase_id = ?1) \
             ORDER BY last_activity_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![codebase_id], row_to_workspace)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
