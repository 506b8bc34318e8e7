//! libSQL backend: async `TaskStore` implementation.
//!
//! A single connection is held behind an async mutex so that `close()` can
//! take it out and every later call sees `DatabaseError::Closed`. Admission
//! additionally runs inside `BEGIN IMMEDIATE`, which keeps the
//! check-and-insert atomic against other processes sharing the file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CapacityConfig;
use crate::error::{AdmissionError, DatabaseError, TaskError};
use crate::store::migrations;
use crate::store::traits::{SUMMARY_MAX_CHARS, TaskStore};
use crate::worker::state::{NewTask, TaskOrigin, TaskRecord, TaskStatus};

/// libSQL-backed task store.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Option<Connection>>,
    limits: CapacityConfig,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn open(path: &Path, limits: CapacityConfig) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, limits).await?;
        info!(path = %path.display(), "Task database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn open_memory(limits: CapacityConfig) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, limits).await
    }

    async fn from_database(db: LibSqlDatabase, limits: CapacityConfig) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Wait for a competing process's write transaction instead of failing fast.
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(Some(conn)),
            limits,
        })
    }

    async fn try_running_count(&self) -> Result<usize, DatabaseError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;
        count_active(conn, None).await
    }

    async fn try_active(&self) -> Result<Vec<TaskRecord>, DatabaseError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM subagents
                     WHERE status IN ('pending', 'running')
                     ORDER BY spawned_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("active: {e}")))?
        {
            tasks.push(row_to_task(&row).map_err(|e| DatabaseError::Query(format!("active: {e}")))?);
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, label, origin, class, status, spawned_at, started_at, completed_at, retry_count, stack_frame, result_summary";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, libsql::Error> {
    let origin_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let spawned_str: String = row.get(5)?;
    let started_str: Option<String> = row.get(6).ok();
    let completed_str: Option<String> = row.get(7).ok();
    let retry_count: i64 = row.get(8).unwrap_or(0);

    let id: String = row.get(0)?;
    let status = status_str.parse().unwrap_or_else(|e| {
        warn!(task_id = %id, "{e}; treating as lost");
        TaskStatus::Lost
    });

    Ok(TaskRecord {
        label: row.get(1)?,
        origin: origin_str.parse().unwrap_or(TaskOrigin::User),
        class: row.get(3).ok(),
        status,
        spawned_at: parse_datetime(&spawned_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        stack_frame: row.get(9).ok(),
        result_summary: row.get(10).ok(),
        id,
    })
}

/// Count pending + running tasks, optionally within one class.
async fn count_active(conn: &Connection, class: Option<&str>) -> Result<usize, DatabaseError> {
    let mut rows = match class {
        Some(class) => {
            conn.query(
                "SELECT COUNT(*) FROM subagents
                 WHERE status IN ('pending', 'running') AND class = ?1",
                params![class],
            )
            .await
        }
        None => {
            conn.query(
                "SELECT COUNT(*) FROM subagents WHERE status IN ('pending', 'running')",
                (),
            )
            .await
        }
    }
    .map_err(|e| DatabaseError::Query(format!("count_active: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("count_active: {e}")))?;
    let count: i64 = match row {
        Some(row) => row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("count_active: {e}")))?,
        None => 0,
    };
    Ok(usize::try_from(count).unwrap_or(0))
}

async fn fetch_task(conn: &Connection, id: &str) -> Result<Option<TaskRecord>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TASK_COLUMNS} FROM subagents WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?
    {
        Some(row) => Ok(Some(
            row_to_task(&row).map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?,
        )),
        None => Ok(None),
    }
}

/// `status IN (...)` clause admitting exactly the states that may move to `target`.
fn transition_guard(target: TaskStatus) -> String {
    let sources: Vec<String> = TaskStatus::sources_of(target)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    format!("status IN ({})", sources.join(", "))
}

/// Explain why a guarded UPDATE touched no rows.
async fn transition_error(conn: &Connection, id: &str, target: TaskStatus) -> TaskError {
    match fetch_task(conn, id).await {
        Ok(Some(task)) => TaskError::InvalidTransition {
            id: id.to_string(),
            state: task.status.to_string(),
            target: target.to_string(),
        },
        Ok(None) => TaskError::NotFound { id: id.to_string() },
        Err(e) => TaskError::Database(e),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!("Task database closed");
        }
    }

    fn limits(&self) -> &CapacityConfig {
        &self.limits
    }

    async fn admit(&self, task: &NewTask) -> Result<TaskRecord, AdmissionError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("admit: begin: {e}")))?;

        let running = count_active(&tx, None).await?;
        if running >= self.limits.max_concurrent {
            let _ = tx.rollback().await;
            return Err(AdmissionError::Capacity {
                scope: "global".to_string(),
                running,
                limit: self.limits.max_concurrent,
            });
        }

        if let Some(class) = task.class.as_deref()
            && let Some(&limit) = self.limits.per_class.get(class)
        {
            let in_class = count_active(&tx, Some(class)).await?;
            if in_class >= limit {
                let _ = tx.rollback().await;
                return Err(AdmissionError::Capacity {
                    scope: format!("class {class}"),
                    running: in_class,
                    limit,
                });
            }
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO subagents (id, label, origin, class, status, spawned_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0)",
            params![
                task.id.as_str(),
                task.label.as_str(),
                task.origin.as_str(),
                opt_text(task.class.as_deref()),
                now.to_rfc3339()
            ],
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("UNIQUE") {
                DatabaseError::Constraint(format!("admit: duplicate task id {}", task.id))
            } else {
                DatabaseError::Query(format!("admit: {msg}"))
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("admit: commit: {e}")))?;

        debug!(task_id = %task.id, label = %task.label, "Task admitted");
        Ok(TaskRecord {
            id: task.id.clone(),
            label: task.label.clone(),
            origin: task.origin,
            class: task.class.clone(),
            status: TaskStatus::Pending,
            spawned_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            result_summary: None,
            stack_frame: None,
        })
    }

    async fn mark_running(&self, id: &str) -> Result<(), TaskError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE subagents SET status = 'running', started_at = ?2
                     WHERE id = ?1 AND {}",
                    transition_guard(TaskStatus::Running)
                ),
                params![id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_running: {e}")))?;
        if changed == 0 {
            return Err(transition_error(conn, id, TaskStatus::Running).await);
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: &str,
        status: TaskStatus,
        summary: &str,
    ) -> Result<(), TaskError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;
        if !matches!(status, TaskStatus::Completed | TaskStatus::Failed) {
            return Err(transition_error(conn, id, status).await);
        }

        let changed = conn
            .execute(
                &format!(
                    "UPDATE subagents SET status = ?2, completed_at = ?3, result_summary = ?4
                     WHERE id = ?1 AND {}",
                    transition_guard(status)
                ),
                params![
                    id,
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    truncate_chars(summary, SUMMARY_MAX_CHARS)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalize: {e}")))?;
        if changed == 0 {
            return Err(transition_error(conn, id, status).await);
        }
        Ok(())
    }

    async fn mark_lost(&self, id: &str, diagnostic: &str) -> Result<(), TaskError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE subagents SET status = 'lost', completed_at = ?2, stack_frame = ?3
                     WHERE id = ?1 AND {}",
                    transition_guard(TaskStatus::Lost)
                ),
                params![id, Utc::now().to_rfc3339(), diagnostic],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_lost: {e}")))?;
        if changed == 0 {
            return Err(transition_error(conn, id, TaskStatus::Lost).await);
        }
        Ok(())
    }

    async fn requeue(&self, id: &str) -> Result<(), TaskError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE subagents
                     SET status = 'cancelled_requeue', completed_at = ?2, retry_count = retry_count + 1
                     WHERE id = ?1 AND {}",
                    transition_guard(TaskStatus::CancelledRequeue)
                ),
                params![id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue: {e}")))?;
        if changed == 0 {
            return Err(transition_error(conn, id, TaskStatus::CancelledRequeue).await);
        }
        Ok(())
    }

    async fn recover_on_startup(&self) -> Result<u64, DatabaseError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;
        let changed = conn
            .execute(
                "UPDATE subagents
                 SET status = 'lost', completed_at = ?1, stack_frame = COALESCE(stack_frame, ?2)
                 WHERE status IN ('pending', 'running')",
                params![Utc::now().to_rfc3339(), "process restarted"],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_on_startup: {e}")))?;
        if changed > 0 {
            warn!(count = changed, "Marked orphaned subagent tasks as lost");
        }
        Ok(changed)
    }

    async fn running_count(&self) -> usize {
        self.try_running_count().await.unwrap_or_else(|e| {
            warn!("running_count unavailable: {e}");
            0
        })
    }

    async fn active(&self) -> Vec<TaskRecord> {
        self.try_active().await.unwrap_or_else(|e| {
            warn!("active tasks unavailable: {e}");
            Vec::new()
        })
    }

    async fn retry_count_of(&self, id: &str) -> u32 {
        match self.get(id).await {
            Ok(task) => task.map(|t| t.retry_count).unwrap_or(0),
            Err(e) => {
                warn!(task_id = %id, "retry_count unavailable: {e}");
                0
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<TaskRecord>, DatabaseError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(DatabaseError::Closed)?;
        fetch_task(conn, id).await
    }
}
