//! SQLite-backed task store.
//!
//! One table holds every task. Timestamps are stored as epoch milliseconds.
//! The claim is a single `UPDATE ... WHERE id = (SELECT ...) RETURNING`
//! statement, so two processes sharing the same database file can never both
//! win the same row.
//!
//! rusqlite is synchronous; every call runs on the blocking pool behind one
//! connection mutex.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};

use crate::app::status::QueueCounts;
use crate::domain::{LeaseId, SpindleError, TaskId, TaskRecord, TaskStatus, TaskType};
use crate::ports::TaskStore;

pub const DEFAULT_TABLE: &str = "tasks";

const COLUMNS: &str = "id, task_type, payload, status, attempts, scheduled_for_ms, \
                       lease_owner, lease_expires_at_ms, created_at_ms, heartbeat_at_ms, last_error";

#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    table: Arc<str>,
}

impl SqliteTaskStore {
    /// Open (or create) a database file and make sure the task table exists.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self, SpindleError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| driver("open sqlite task store", e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| driver("set busy timeout", e))?;
        Self::with_connection(conn, table)
    }

    /// Private in-memory database. Handy for tests and demos.
    pub fn open_in_memory(table: &str) -> Result<Self, SpindleError> {
        let conn =
            Connection::open_in_memory().map_err(|e| driver("open in-memory sqlite", e))?;
        Self::with_connection(conn, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self, SpindleError> {
        validate_table_name(table)?;
        ensure_schema(&conn, table)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: Arc::from(table),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, SpindleError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> Result<T, SpindleError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = Arc::clone(&self.table);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| SpindleError::Persistence("sqlite task store lock poisoned".into()))?;
            f(&conn, &table)
        })
        .await
        .map_err(|e| SpindleError::Persistence(format!("{op}: blocking task failed: {e}")))?
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table_name(table: &str) -> Result<(), SpindleError> {
    let mut chars = table.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_head && valid_tail && table.len() <= 63 {
        Ok(())
    } else {
        Err(SpindleError::Config(format!(
            "invalid task table name '{table}'"
        )))
    }
}

fn ensure_schema(conn: &Connection, table: &str) -> Result<(), SpindleError> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
          id TEXT PRIMARY KEY,
          task_type TEXT NOT NULL,
          payload TEXT NOT NULL,
          status TEXT NOT NULL,
          attempts INTEGER NOT NULL DEFAULT 0,
          scheduled_for_ms INTEGER NOT NULL,
          lease_owner TEXT NULL,
          lease_expires_at_ms INTEGER NULL,
          created_at_ms INTEGER NOT NULL,
          heartbeat_at_ms INTEGER NOT NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_status_scheduled ON {table}(status, scheduled_for_ms);
        "#
    ))
    .map_err(|e| driver("init sqlite task schema", e))
}

fn driver(op: &str, e: rusqlite::Error) -> SpindleError {
    SpindleError::Persistence(format!("{op}: {e}"))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, SpindleError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SpindleError::Persistence(format!("timestamp out of range: {ms}")))
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> SpindleError {
    SpindleError::Persistence(format!("corrupt task row ({column}): {detail}"))
}

/// Column values exactly as SQLite hands them back.
struct TaskRow {
    id: String,
    task_type: String,
    payload: String,
    status: String,
    attempts: i64,
    scheduled_for_ms: i64,
    lease_owner: Option<String>,
    lease_expires_at_ms: Option<i64>,
    created_at_ms: i64,
    heartbeat_at_ms: i64,
    last_error: Option<String>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            scheduled_for_ms: row.get(5)?,
            lease_owner: row.get(6)?,
            lease_expires_at_ms: row.get(7)?,
            created_at_ms: row.get(8)?,
            heartbeat_at_ms: row.get(9)?,
            last_error: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, SpindleError> {
        let lease_owner = self
            .lease_owner
            .as_deref()
            .map(LeaseId::from_str)
            .transpose()
            .map_err(|e| corrupt("lease_owner", e))?;
        Ok(TaskRecord {
            id: TaskId::from_str(&self.id).map_err(|e| corrupt("id", e))?,
            task_type: TaskType::new(self.task_type),
            payload: serde_json::from_str(&self.payload).map_err(|e| corrupt("payload", e))?,
            status: TaskStatus::from_str(&self.status).map_err(|e| corrupt("status", e))?,
            attempts: u32::try_from(self.attempts).map_err(|e| corrupt("attempts", e))?,
            scheduled_for: ms_to_dt(self.scheduled_for_ms)?,
            lease_owner,
            lease_expires_at: self.lease_expires_at_ms.map(ms_to_dt).transpose()?,
            created_at: ms_to_dt(self.created_at_ms)?,
            heartbeat_at: ms_to_dt(self.heartbeat_at_ms)?,
            last_error: self.last_error,
        })
    }
}

/// Turn a zero-row guarded update into the right error.
fn guarded_miss(conn: &Connection, table: &str, id: TaskId) -> SpindleError {
    let exists = conn
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE id = ?1"),
            params![id.to_string()],
            |_| Ok(()),
        )
        .optional();
    match exists {
        Ok(Some(())) => SpindleError::LeaseLost { task_id: id },
        Ok(None) => SpindleError::Persistence(format!("no task record for {id}")),
        Err(e) => driver("lookup task", e),
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), SpindleError> {
        let payload = serde_json::to_string(&record.payload)?;
        self.run("insert task", move |conn, table| {
            let result = conn.execute(
                &format!("INSERT INTO {table} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    record.id.to_string(),
                    record.task_type.as_str(),
                    payload,
                    record.status.as_str(),
                    i64::from(record.attempts),
                    dt_to_ms(record.scheduled_for),
                    record.lease_owner.map(|l| l.to_string()),
                    record.lease_expires_at.map(dt_to_ms),
                    dt_to_ms(record.created_at),
                    dt_to_ms(record.heartbeat_at),
                    record.last_error,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(SpindleError::Persistence(format!(
                        "duplicate task id {}",
                        record.id
                    )))
                }
                Err(e) => Err(driver("insert task", e)),
            }
        })
        .await
    }

    async fn claim_next_due(
        &self,
        now: DateTime<Utc>,
        lease: LeaseId,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, SpindleError> {
        self.run("claim task", move |conn, table| {
            let row = conn
                .query_row(
                    &format!(
                        "UPDATE {table}
                         SET status = 'RUNNING', lease_owner = ?2, lease_expires_at_ms = ?3, heartbeat_at_ms = ?1
                         WHERE id = (
                           SELECT id FROM {table}
                           WHERE status = 'PENDING' AND scheduled_for_ms <= ?1
                           ORDER BY scheduled_for_ms, created_at_ms, id
                           LIMIT 1
                         ) AND status = 'PENDING'
                         RETURNING {COLUMNS}"
                    ),
                    params![dt_to_ms(now), lease.to_string(), dt_to_ms(lease_expires_at)],
                    TaskRow::read,
                )
                .optional()
                .map_err(|e| driver("claim task", e))?;
            row.map(TaskRow::into_record).transpose()
        })
        .await
    }

    async fn mark_done(
        &self,
        id: TaskId,
        lease: LeaseId,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError> {
        self.run("mark task done", move |conn, table| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table}
                         SET status = 'DONE', lease_owner = NULL, lease_expires_at_ms = NULL, heartbeat_at_ms = ?3
                         WHERE id = ?1 AND status = 'RUNNING' AND lease_owner = ?2"
                    ),
                    params![id.to_string(), lease.to_string(), dt_to_ms(now)],
                )
                .map_err(|e| driver("mark task done", e))?;
            if changed == 0 {
                return Err(guarded_miss(conn, table, id));
            }
            Ok(())
        })
        .await
    }

    async fn mark_retry(
        &self,
        id: TaskId,
        lease: LeaseId,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError> {
        let error = error.to_string();
        self.run("mark task retry", move |conn, table| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table}
                         SET status = 'PENDING', attempts = attempts + 1,
                             scheduled_for_ms = MAX(scheduled_for_ms, ?3),
                             lease_owner = NULL, lease_expires_at_ms = NULL,
                             last_error = ?4, heartbeat_at_ms = ?5
                         WHERE id = ?1 AND status = 'RUNNING' AND lease_owner = ?2"
                    ),
                    params![
                        id.to_string(),
                        lease.to_string(),
                        dt_to_ms(next_run_at),
                        error,
                        dt_to_ms(now)
                    ],
                )
                .map_err(|e| driver("mark task retry", e))?;
            if changed == 0 {
                return Err(guarded_miss(conn, table, id));
            }
            Ok(())
        })
        .await
    }

    async fn mark_dead(
        &self,
        id: TaskId,
        lease: LeaseId,
        reason: &str,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError> {
        let reason = reason.to_string();
        self.run("mark task dead", move |conn, table| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table}
                         SET status = 'DEAD', attempts = attempts + ?3,
                             lease_owner = NULL, lease_expires_at_ms = NULL,
                             last_error = ?4, heartbeat_at_ms = ?5
                         WHERE id = ?1 AND status = 'RUNNING' AND lease_owner = ?2"
                    ),
                    params![
                        id.to_string(),
                        lease.to_string(),
                        i64::from(count_attempt),
                        reason,
                        dt_to_ms(now)
                    ],
                )
                .map_err(|e| driver("mark task dead", e))?;
            if changed == 0 {
                return Err(guarded_miss(conn, table, id));
            }
            Ok(())
        })
        .await
    }

    async fn refresh_heartbeat(
        &self,
        id: TaskId,
        lease: LeaseId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, SpindleError> {
        self.run("refresh heartbeat", move |conn, table| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table}
                         SET heartbeat_at_ms = ?3, lease_expires_at_ms = ?4
                         WHERE id = ?1 AND status = 'RUNNING' AND lease_owner = ?2"
                    ),
                    params![
                        id.to_string(),
                        lease.to_string(),
                        dt_to_ms(now),
                        dt_to_ms(lease_expires_at)
                    ],
                )
                .map_err(|e| driver("refresh heartbeat", e))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, SpindleError> {
        self.run("reclaim stale tasks", move |conn, table| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table}
                         SET status = 'PENDING', lease_owner = NULL, lease_expires_at_ms = NULL
                         WHERE status = 'RUNNING' AND heartbeat_at_ms < ?1"
                    ),
                    params![dt_to_ms(older_than)],
                )
                .map_err(|e| driver("reclaim stale tasks", e))?;
            Ok(changed as u64)
        })
        .await
    }

    async fn has_pending(&self, now: DateTime<Utc>) -> Result<bool, SpindleError> {
        self.run("check pending tasks", move |conn, table| {
            conn.query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM {table} WHERE status = 'PENDING' AND scheduled_for_ms <= ?1)"
                ),
                params![dt_to_ms(now)],
                |row| row.get::<_, bool>(0),
            )
            .map_err(|e| driver("check pending tasks", e))
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, SpindleError> {
        self.run("get task", move |conn, table| {
            let row = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM {table} WHERE id = ?1"),
                    params![id.to_string()],
                    TaskRow::read,
                )
                .optional()
                .map_err(|e| driver("get task", e))?;
            row.map(TaskRow::into_record).transpose()
        })
        .await
    }

    async fn counts_by_status(&self) -> Result<QueueCounts, SpindleError> {
        self.run("count tasks", move |conn, table| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT status, COUNT(*) FROM {table} GROUP BY status"
                ))
                .map_err(|e| driver("prepare count tasks", e))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| driver("query count tasks", e))?;

            let mut counts = QueueCounts::default();
            for row in rows {
                let (status, n) = row.map_err(|e| driver("read count row", e))?;
                let status = TaskStatus::from_str(&status).map_err(|e| corrupt("status", e))?;
                counts.add(status, usize::try_from(n).unwrap_or(0));
            }
            Ok(counts)
        })
        .await
    }
}
