use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{ExecutionRecord, WorkflowStore};
use weaver_core::types::{ExecutionId, ExecutionStatus, WorkflowDef};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        snapshot TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_workflow
        ON executions(workflow_id, started_at DESC);";

/// SQLite-backed store for workflow definitions and terminal execution
/// snapshots.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> WeaverError {
    WeaverError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Workflow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }
}

type Row = (String, String, String, String, Option<String>, String);

fn row_to_record(row: Row) -> Result<ExecutionRecord> {
    let (execution_id, workflow_id, status, started_at, finished_at, snapshot) = row;
    Ok(ExecutionRecord {
        execution_id: ExecutionId::from_str(&execution_id),
        workflow_id,
        status: parse_status(&status)?,
        started_at: parse_time(&started_at),
        finished_at: finished_at.as_deref().map(parse_time),
        snapshot: serde_json::from_str(&snapshot)?,
    })
}

fn parse_status(s: &str) -> Result<ExecutionStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| db_err(format!("Unknown execution status: {}", s)))
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const SELECT_EXECUTION: &str =
    "SELECT execution_id, workflow_id, status, started_at, finished_at, snapshot FROM executions";

impl WorkflowStore for SqliteStore {
    fn save_workflow(&self, workflow: &WorkflowDef) -> BoxFuture<'_, Result<()>> {
        let id = workflow.id.clone();
        let name = workflow.name.clone();
        let definition = serde_json::to_string(workflow);

        Box::pin(async move {
            let definition = definition?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflows (id, name, definition, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     definition = excluded.definition,
                     updated_at = excluded.updated_at",
                params![id, name, definition, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            debug!(workflow_id = %id, "Workflow saved");
            Ok(())
        })
    }

    fn load_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<WorkflowDef>>> {
        let workflow_id = workflow_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let definition: Option<String> = conn
                .query_row(
                    "SELECT definition FROM workflows WHERE id = ?1",
                    params![workflow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            definition
                .map(|d| serde_json::from_str(&d).map_err(WeaverError::from))
                .transpose()
        })
    }

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT id FROM workflows ORDER BY id")
                .map_err(db_err)?;
            let ids = stmt
                .query_map([], |row| row.get(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<String>, _>>()
                .map_err(db_err)?;
            Ok(ids)
        })
    }

    fn save_execution(&self, record: &ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();

        Box::pin(async move {
            let snapshot = serde_json::to_string(&record.snapshot)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO executions
                     (execution_id, workflow_id, status, started_at, finished_at, snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.execution_id.as_str(),
                    record.workflow_id,
                    record.status.as_str(),
                    record.started_at.to_rfc3339(),
                    record.finished_at.map(|t| t.to_rfc3339()),
                    snapshot,
                ],
            )
            .map_err(db_err)?;
            debug!(execution_id = %record.execution_id, status = %record.status, "Execution saved");
            Ok(())
        })
    }

    fn load_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<ExecutionRecord>>> {
        let execution_id = execution_id.as_str().to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let row: Option<Row> = conn
                .query_row(
                    &format!("{SELECT_EXECUTION} WHERE execution_id = ?1"),
                    params![execution_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;

            row.map(row_to_record).transpose()
        })
    }

    fn list_executions(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        let workflow_id = workflow_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "{SELECT_EXECUTION} WHERE workflow_id = ?1 ORDER BY started_at DESC, execution_id DESC"
                ))
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![workflow_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })
                .map_err(db_err)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row_to_record(row.map_err(db_err)?)?);
            }
            Ok(records)
        })
    }
}
