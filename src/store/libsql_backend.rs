//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Scalar task fields map to
//! columns; nested structures (plan, current step, log, memory, pending
//! messages) are stored as JSON text columns.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::Task;
use crate::tasks::state::TaskStatus;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

/// Parse an RFC 3339 string into DateTime<Utc>, tolerating SQLite datetime().
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn json_column<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("Bad JSON in column {column}: {e}")))
}

fn to_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("Cannot encode column {column}: {e}")))
}

/// Map a libsql row (TASK_COLUMNS order) to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("Bad column {idx}: {e}")))
    };

    let id_str = get_text(0)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("Bad task id '{id_str}': {e}")))?;
    let status_str = get_text(2)?;
    let status = TaskStatus::from_str(&status_str).map_err(DatabaseError::Query)?;

    let next_check: Option<String> = row.get(11).ok();
    let auto_send: i64 = row
        .get(8)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let hidden: i64 = row
        .get(13)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    Ok(Task {
        id,
        title: get_text(1)?,
        status,
        original_request: get_text(3)?,
        kind: json_column("kind", &get_text(4)?)?,
        plan: json_column("plan", &get_text(5)?)?,
        current_step: json_column("current_step", &get_text(6)?)?,
        poll_frequency: json_column("poll_frequency", &get_text(7)?)?,
        auto_send: auto_send != 0,
        execution_log: json_column("execution_log", &get_text(9)?)?,
        context_memory: json_column("context_memory", &get_text(10)?)?,
        next_check: next_check.as_deref().map(parse_datetime),
        pending_messages: json_column("pending_messages", &get_text(12)?)?,
        hidden: hidden != 0,
        created: parse_datetime(&get_text(14)?),
        last_updated: parse_datetime(&get_text(15)?),
    })
}

const TASK_COLUMNS: &str = "id, title, status, original_request, kind, plan, current_step, \
     poll_frequency, auto_send, execution_log, context_memory, next_check, \
     pending_messages, hidden, created, last_updated";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::apply(self.conn()).await
    }

    async fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT OR REPLACE INTO tasks ({TASK_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        );
        self.conn()
            .execute(
                &sql,
                params![
                    task.id.to_string(),
                    task.title.clone(),
                    task.status.to_string(),
                    task.original_request.clone(),
                    to_json("kind", &task.kind)?,
                    to_json("plan", &task.plan)?,
                    to_json("current_step", &task.current_step)?,
                    to_json("poll_frequency", &task.poll_frequency)?,
                    i64::from(task.auto_send),
                    to_json("execution_log", &task.execution_log)?,
                    to_json("context_memory", &task.context_memory)?,
                    task.next_check.map(|t| t.to_rfc3339()),
                    to_json("pending_messages", &task.pending_messages)?,
                    i64::from(task.hidden),
                    task.created.to_rfc3339(),
                    task.last_updated.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to upsert task: {e}")))?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to get task: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY last_updated DESC");
        let mut rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to list tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn list_open_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status NOT IN ('completed', 'failed', 'cancelled') \
             ORDER BY next_check ASC"
        );
        let mut rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to list open tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}
