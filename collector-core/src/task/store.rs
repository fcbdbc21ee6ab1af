use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::error::{TaskError, TaskResult};
use super::models::{
    FailedDomain, LogLevel, NewTask, Task, TaskFields, TaskFilter, TaskLogEntry, TaskStatus,
};

const TASKS_SCHEMA: &str = include_str!("../../../sql/tasks.sql");

pub const INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

/// Result of a guarded attempt to move a task into `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed { version: i64 },
    AccountBusy,
    AtCapacity,
}

#[derive(Debug, Clone)]
pub struct SqliteTaskStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteTaskStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteTaskStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> TaskResult<SqliteTaskStore> {
        let path = self.path.ok_or(TaskError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteTaskStore { path, flags })
    }
}

/// Task rows and their append-only log. Every status write is a single guarded
/// `UPDATE` so several worker processes can share one database file.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteTaskStore {
    pub fn builder() -> SqliteTaskStoreBuilder {
        SqliteTaskStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> TaskResult<Self> {
        SqliteTaskStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_read_only(&self) -> bool {
        self.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY)
    }

    fn open(&self) -> TaskResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            TaskError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn, self.is_read_only()).map_err(|source| TaskError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> TaskResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(TASKS_SCHEMA)?;
        Ok(())
    }

    pub fn insert(&self, task: &NewTask) -> TaskResult<Task> {
        let conn = self.open()?;
        let task_id = task
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sub_domains = task
            .sub_domains
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO collection_tasks (
                task_id, platform, account_id, status, data_domains, sub_domains,
                date_from, date_to, granularity
            ) VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8)",
            params![
                task_id,
                &task.platform,
                &task.account_id,
                serde_json::to_string(&task.data_domains)?,
                sub_domains,
                task.date_from,
                task.date_to,
                &task.granularity,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::fetch(&conn, id)
    }

    pub fn get(&self, id: i64) -> TaskResult<Task> {
        let conn = self.open()?;
        Self::fetch(&conn, id)
    }

    pub fn find_by_task_id(&self, task_id: &str) -> TaskResult<Option<Task>> {
        let conn = self.open()?;
        let task = conn
            .query_row(
                "SELECT * FROM collection_tasks WHERE task_id = ?1",
                [task_id],
                Task::from_row,
            )
            .optional()?;
        Ok(task)
    }

    fn fetch(conn: &Connection, id: i64) -> TaskResult<Task> {
        conn.query_row(
            "SELECT * FROM collection_tasks WHERE id = ?1",
            [id],
            Task::from_row,
        )
        .optional()?
        .ok_or(TaskError::NotFound(id))
    }

    pub fn list(&self, filter: &TaskFilter) -> TaskResult<Vec<Task>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM collection_tasks");
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            params.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(account) = &filter.account_id {
            clauses.push("account_id = ?");
            params.push(Value::Text(account.clone()));
        }
        if let Some(platform) = &filter.platform {
            clauses.push("platform = ?");
            params.push(Value::Text(platform.clone()));
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(Task::from_row(row)?);
        }
        Ok(tasks)
    }

    /// Queued tasks, oldest first.
    pub fn queued(&self, limit: usize) -> TaskResult<Vec<Task>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM collection_tasks WHERE status = 'queued'
             ORDER BY created_at ASC, id ASC LIMIT ?1",
        )?;
        let tasks = stmt
            .query_map([limit as i64], Task::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn running_count(&self) -> TaskResult<i64> {
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM collection_tasks WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Whether another task of the same account and platform is running or paused.
    pub fn has_account_conflict(
        &self,
        account_id: &str,
        platform: &str,
        exclude_id: i64,
    ) -> TaskResult<bool> {
        let conn = self.open()?;
        let busy: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM collection_tasks
                WHERE account_id = ?1 AND platform = ?2 AND id != ?3
                  AND status IN ('running', 'paused')
            )",
            params![account_id, platform, exclude_id],
            |row| row.get(0),
        )?;
        Ok(busy != 0)
    }

    pub fn status_counts(&self) -> TaskResult<BTreeMap<String, i64>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM collection_tasks GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }

    /// Conditional update: the row changes only if it still carries the expected
    /// version/status and `new_status` is reachable from its current status.
    /// Returns the stored version after the write.
    pub fn update_status(
        &self,
        id: i64,
        new_status: TaskStatus,
        expected_version: Option<i64>,
        expected_status: Option<TaskStatus>,
        fields: &TaskFields,
    ) -> TaskResult<i64> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (sql, values) =
            build_guarded_update(id, new_status, expected_version, expected_status, fields, None)?;
        let affected = tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        if affected == 0 {
            let rejection = classify_rejection(&tx, id, new_status, expected_version, expected_status)?;
            return Err(rejection.unwrap_or(TaskError::NotFound(id)));
        }
        let version = current_version(&tx, id)?;
        tx.commit()?;
        Ok(version)
    }

    /// Moves a task into `running` only while the fresh running count is below
    /// `limit` and no sibling task holds the same account.
    pub fn claim_running(
        &self,
        id: i64,
        expected_version: i64,
        expected_status: TaskStatus,
        limit: usize,
    ) -> TaskResult<ClaimOutcome> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let fields = TaskFields::default();
        let (sql, values) = build_guarded_update(
            id,
            TaskStatus::Running,
            Some(expected_version),
            Some(expected_status),
            &fields,
            Some(limit),
        )?;
        let affected = tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        if affected == 0 {
            if let Some(rejection) = classify_rejection(
                &tx,
                id,
                TaskStatus::Running,
                Some(expected_version),
                Some(expected_status),
            )? {
                return Err(rejection);
            }
            let busy: i64 = tx.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM collection_tasks other, collection_tasks me
                    WHERE me.id = ?1 AND other.id != me.id
                      AND other.account_id = me.account_id AND other.platform = me.platform
                      AND other.status IN ('running', 'paused')
                )",
                [id],
                |row| row.get(0),
            )?;
            return Ok(if busy != 0 {
                ClaimOutcome::AccountBusy
            } else {
                ClaimOutcome::AtCapacity
            });
        }
        let version = current_version(&tx, id)?;
        tx.commit()?;
        Ok(ClaimOutcome::Claimed { version })
    }

    /// Run once at process start: no task can still be running after a crash.
    pub fn mark_interrupted_on_restart(&self) -> TaskResult<usize> {
        let conn = self.open()?;
        let now = Utc::now().naive_utc();
        let affected = conn.execute(
            "UPDATE collection_tasks
             SET status = 'interrupted', version = version + 1, error_message = ?1,
                 verification_type = NULL, screenshot_path = NULL,
                 updated_at = ?2, completed_at = ?2
             WHERE status = 'running'",
            params![INTERRUPTED_MESSAGE, now],
        )?;
        Ok(affected)
    }

    pub fn append_log(
        &self,
        task_row_id: i64,
        level: LogLevel,
        message: &str,
        details: Option<&serde_json::Value>,
    ) -> TaskResult<i64> {
        let conn = self.open()?;
        let details = details.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO collection_task_logs (task_row_id, level, message, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task_row_id,
                level.as_str(),
                message,
                details,
                Utc::now().naive_utc()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn logs(&self, task_row_id: i64, limit: Option<usize>) -> TaskResult<Vec<TaskLogEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM collection_task_logs WHERE task_row_id = ?1
             ORDER BY id ASC LIMIT ?2",
        )?;
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let entries = stmt
            .query_map(params![task_row_id, limit], TaskLogEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn build_guarded_update(
    id: i64,
    new_status: TaskStatus,
    expected_version: Option<i64>,
    expected_status: Option<TaskStatus>,
    fields: &TaskFields,
    running_limit: Option<usize>,
) -> TaskResult<(String, Vec<Value>)> {
    let now = Utc::now().naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string();
    let mut assignments: Vec<String> = vec![
        "status = ?".into(),
        "version = version + 1".into(),
        "updated_at = ?".into(),
    ];
    let mut values: Vec<Value> = vec![
        Value::Text(new_status.as_str().to_string()),
        Value::Text(now.clone()),
    ];

    let mut assign = |column: &str, value: Value| {
        assignments.push(format!("{column} = ?"));
        values.push(value);
    };
    if let Some(progress) = fields.progress {
        assign("progress", Value::Integer(progress));
    }
    if let Some(step) = &fields.current_step {
        assign("current_step", Value::Text(step.clone()));
    }
    if let Some(message) = &fields.error_message {
        assign("error_message", Value::Text(message.clone()));
    }
    if let Some(files) = &fields.collected_files {
        assign("collected_files", Value::Text(serde_json::to_string(files)?));
        assign("files_collected", Value::Integer(files.len() as i64));
    }
    if let Some(completed) = &fields.completed_domains {
        assign("completed_domains", Value::Text(serde_json::to_string(completed)?));
    }
    if let Some(failed) = &fields.failed_domains {
        assign(
            "failed_domains",
            Value::Text(serde_json::to_string::<Vec<FailedDomain>>(failed)?),
        );
    }
    if let Some(duration) = fields.duration_seconds {
        assign("duration_seconds", Value::Real(duration));
    }
    if new_status == TaskStatus::Paused {
        if let Some(kind) = &fields.verification_type {
            assign("verification_type", Value::Text(kind.clone()));
        }
        if let Some(path) = &fields.screenshot_path {
            assign("screenshot_path", Value::Text(path.clone()));
        }
    }
    if new_status.is_terminal() {
        assign("completed_at", Value::Text(now.clone()));
    }
    if new_status != TaskStatus::Paused {
        assignments.push("verification_type = NULL".into());
        assignments.push("screenshot_path = NULL".into());
    }
    if new_status == TaskStatus::Running {
        assignments.push("started_at = COALESCE(started_at, ?)".into());
        values.push(Value::Text(now));
    }

    let mut sql = format!(
        "UPDATE collection_tasks SET {} WHERE id = ?",
        assignments.join(", ")
    );
    values.push(Value::Integer(id));
    if let Some(version) = expected_version {
        sql.push_str(" AND version = ?");
        values.push(Value::Integer(version));
    }
    if let Some(status) = expected_status {
        sql.push_str(" AND status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    let predecessors = TaskStatus::predecessors_of(new_status);
    if predecessors.is_empty() {
        sql.push_str(" AND 0");
    } else {
        let placeholders = vec!["?"; predecessors.len()].join(", ");
        sql.push_str(&format!(" AND status IN ({placeholders})"));
        values.extend(
            predecessors
                .into_iter()
                .map(|status| Value::Text(status.as_str().to_string())),
        );
    }
    if let Some(limit) = running_limit {
        sql.push_str(
            " AND (SELECT COUNT(*) FROM collection_tasks WHERE status = 'running') < ?
              AND NOT EXISTS (
                  SELECT 1 FROM collection_tasks other
                  WHERE other.account_id = collection_tasks.account_id
                    AND other.platform = collection_tasks.platform
                    AND other.id != collection_tasks.id
                    AND other.status IN ('running', 'paused')
              )",
        );
        values.push(Value::Integer(limit as i64));
    }
    Ok((sql, values))
}

/// Explains why a guarded update touched no row. `None` means the base guards
/// hold and the rejection came from an extra admission guard.
fn classify_rejection(
    tx: &Transaction<'_>,
    id: i64,
    new_status: TaskStatus,
    expected_version: Option<i64>,
    expected_status: Option<TaskStatus>,
) -> TaskResult<Option<TaskError>> {
    let current: Option<(String, i64)> = tx
        .query_row(
            "SELECT status, version FROM collection_tasks WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((status, version)) = current else {
        return Ok(Some(TaskError::NotFound(id)));
    };
    let actual: TaskStatus = status.parse()?;
    if let Some(expected) = expected_version {
        if expected != version {
            return Ok(Some(TaskError::OptimisticLock {
                id,
                expected,
                actual: version,
            }));
        }
    }
    if let Some(expected) = expected_status {
        if expected != actual {
            return Ok(Some(TaskError::StatusConflict {
                id,
                expected,
                actual,
            }));
        }
    }
    if !actual.can_transition_to(new_status) {
        return Ok(Some(TaskError::InvalidTransition {
            id,
            from: actual,
            to: new_status,
        }));
    }
    Ok(None)
}

fn current_version(tx: &Transaction<'_>, id: i64) -> TaskResult<i64> {
    let version = tx.query_row(
        "SELECT version FROM collection_tasks WHERE id = ?1",
        [id],
        |row| row.get(0),
    )?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_update_lists_every_predecessor() {
        let (sql, values) = build_guarded_update(
            7,
            TaskStatus::Cancelled,
            Some(3),
            None,
            &TaskFields::default().error_message("stopped"),
            None,
        )
        .unwrap();
        assert!(sql.contains("version = ?"));
        assert!(!sql.contains("AND status = ?"));
        assert!(sql.contains("verification_type = NULL"));
        assert!(sql.contains("completed_at = ?"));
        let placeholders = sql.matches('?').count();
        assert_eq!(placeholders, values.len());
    }

    #[test]
    fn running_updates_keep_first_start_time() {
        let (sql, _) = build_guarded_update(
            1,
            TaskStatus::Running,
            None,
            None,
            &TaskFields::default().progress(40),
            Some(3),
        )
        .unwrap();
        assert!(sql.contains("started_at = COALESCE(started_at, ?)"));
        assert!(sql.contains("NOT EXISTS"));
    }
}
