use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::SessionStorage;
use stepflow_core::types::WorkflowSession;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_accessed_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_workflow ON sessions(workflow_id);";

/// SQLite-backed session storage. Session state is kept as a JSON column.
pub struct SqliteSessionStorage {
    conn: Mutex<Connection>,
}

impl SqliteSessionStorage {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepflowError::Storage(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Session database opened");
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

    /// Number of stored sessions.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| StepflowError::Storage(e.to_string()))?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

fn db_err(e: rusqlite::Error) -> StepflowError {
    StepflowError::Storage(e.to_string())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SessionStorage for SqliteSessionStorage {
    fn save<'a>(&'a self, session: &'a WorkflowSession) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let state = serde_json::to_string(&session.state)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepflowError::Storage(e.to_string()))?;

            conn.execute(
                "INSERT INTO sessions
                    (session_id, workflow_id, state, created_at, updated_at, last_accessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    workflow_id = excluded.workflow_id,
                    state = excluded.state,
                    updated_at = excluded.updated_at,
                    last_accessed_at = excluded.last_accessed_at",
                params![
                    session.session_id,
                    session.workflow_id,
                    state,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                    session.last_accessed_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;

            debug!(session_id = %session.session_id, "Session saved");
            Ok(())
        })
    }

    fn load<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<WorkflowSession>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepflowError::Storage(e.to_string()))?;

            let row = conn
                .query_row(
                    "SELECT workflow_id, state, created_at, updated_at, last_accessed_at
                     FROM sessions WHERE session_id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;

            let Some((workflow_id, state, created, updated, accessed)) = row else {
                return Ok(None);
            };

            let state: HashMap<String, serde_json::Value> = serde_json::from_str(&state)?;
            Ok(Some(WorkflowSession {
                session_id: session_id.to_string(),
                workflow_id,
                state,
                created_at: parse_ts(&created),
                updated_at: parse_ts(&updated),
                last_accessed_at: parse_ts(&accessed),
            }))
        })
    }

    fn delete<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepflowError::Storage(e.to_string()))?;
            conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])
                .map_err(db_err)?;
            Ok(())
        })
    }
}
