use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
    Interrupted,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::PartialSuccess,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Interrupted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::PartialSuccess => "partial_success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::PartialSuccess
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Interrupted
        )
    }

    /// Outgoing edges of the transition graph.
    pub fn successors(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[Queued, Running, Cancelled],
            Queued => &[Running, Cancelled],
            Running => &[
                Completed,
                PartialSuccess,
                Failed,
                Paused,
                Cancelled,
                Interrupted,
            ],
            Paused => &[Running, Cancelled],
            Completed | PartialSuccess | Failed | Cancelled | Interrupted => &[],
        }
    }

    /// Whether a write taking a row from `self` to `target` is legal. Rewriting a
    /// non-terminal status onto itself is a field update and always allowed.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        (*self == target && !self.is_terminal()) || self.successors().contains(&target)
    }

    pub fn predecessors_of(target: TaskStatus) -> Vec<TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(target))
            .collect()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TaskError::InvalidStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDomain {
    pub domain: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub task_id: String,
    pub platform: String,
    pub account_id: String,
    pub status: TaskStatus,
    pub version: i64,
    pub progress: i64,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
    pub files_collected: i64,
    pub collected_files: Vec<String>,
    pub completed_domains: Vec<String>,
    pub failed_domains: Vec<FailedDomain>,
    pub data_domains: Vec<String>,
    pub sub_domains: Option<Vec<String>>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub granularity: String,
    pub verification_type: Option<String>,
    pub screenshot_path: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

impl Task {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let status = status.parse().map_err(|err: TaskError| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
        })?;
        Ok(Self {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            platform: row.get("platform")?,
            account_id: row.get("account_id")?,
            status,
            version: row.get("version")?,
            progress: row.get("progress")?,
            current_step: row.get("current_step")?,
            error_message: row.get("error_message")?,
            files_collected: row.get("files_collected")?,
            collected_files: json_column(row, "collected_files")?,
            completed_domains: json_column(row, "completed_domains")?,
            failed_domains: json_column(row, "failed_domains")?,
            data_domains: json_column(row, "data_domains")?,
            sub_domains: optional_json_column(row, "sub_domains")?,
            date_from: row.get("date_from")?,
            date_to: row.get("date_to")?,
            granularity: row.get("granularity")?,
            verification_type: row.get("verification_type")?,
            screenshot_path: row.get("screenshot_path")?,
            created_at: parse_timestamp(row.get("created_at")?),
            updated_at: parse_timestamp(row.get("updated_at")?),
            started_at: parse_timestamp(row.get("started_at")?),
            completed_at: parse_timestamp(row.get("completed_at")?),
            duration_seconds: row.get("duration_seconds")?,
        })
    }
}

/// Mutable columns written alongside a status change. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct TaskFields {
    pub progress: Option<i64>,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
    pub collected_files: Option<Vec<String>>,
    pub completed_domains: Option<Vec<String>>,
    pub failed_domains: Option<Vec<FailedDomain>>,
    pub verification_type: Option<String>,
    pub screenshot_path: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl TaskFields {
    pub fn progress(mut self, value: i64) -> Self {
        self.progress = Some(value.clamp(0, 100));
        self
    }

    pub fn current_step(mut self, value: impl Into<String>) -> Self {
        self.current_step = Some(value.into());
        self
    }

    pub fn error_message(mut self, value: impl Into<String>) -> Self {
        self.error_message = Some(value.into());
        self
    }

    pub fn domains(
        mut self,
        collected_files: &[String],
        completed: &[String],
        failed: &[FailedDomain],
    ) -> Self {
        self.collected_files = Some(collected_files.to_vec());
        self.completed_domains = Some(completed.to_vec());
        self.failed_domains = Some(failed.to_vec());
        self
    }

    pub fn verification(mut self, kind: impl Into<String>, screenshot: Option<String>) -> Self {
        self.verification_type = Some(kind.into());
        self.screenshot_path = screenshot;
        self
    }

    pub fn duration_seconds(mut self, value: f64) -> Self {
        self.duration_seconds = Some(value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: Option<String>,
    pub platform: String,
    pub account_id: String,
    pub data_domains: Vec<String>,
    pub sub_domains: Option<Vec<String>>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub granularity: String,
}

impl NewTask {
    pub fn new(
        platform: impl Into<String>,
        account_id: impl Into<String>,
        data_domains: Vec<String>,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Self {
        Self {
            task_id: None,
            platform: platform.into(),
            account_id: account_id.into(),
            data_domains,
            sub_domains: None,
            date_from,
            date_to,
            granularity: "daily".to_string(),
        }
    }

    pub fn with_sub_domains(mut self, sub_domains: Vec<String>) -> Self {
        self.sub_domains = Some(sub_domains);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub account_id: Option<String>,
    pub platform: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_row_id: i64,
    pub level: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskLogEntry {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            task_row_id: row.get("task_row_id")?,
            level: row.get("level")?,
            message: row.get("message")?,
            details: optional_json_column(row, "details")?,
            created_at: parse_timestamp(row.get("created_at")?),
        })
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    column: &str,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|value| {
        serde_json::from_str(&value).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
        })
    })
    .transpose()
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for status in TaskStatus::ALL.into_iter().filter(TaskStatus::is_terminal) {
            for target in TaskStatus::ALL {
                assert!(
                    !status.can_transition_to(target),
                    "{status} -> {target} must be rejected"
                );
            }
        }
    }

    #[test]
    fn running_accepts_progress_rewrites() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::PartialSuccess));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Paused));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn predecessors_of_running() {
        let mut predecessors = TaskStatus::predecessors_of(TaskStatus::Running);
        predecessors.sort_by_key(|status| status.as_str());
        assert_eq!(
            predecessors,
            vec![
                TaskStatus::Paused,
                TaskStatus::Pending,
                TaskStatus::Queued,
                TaskStatus::Running
            ]
        );
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!(matches!(
            "done".parse::<TaskStatus>(),
            Err(TaskError::InvalidStatus(_))
        ));
    }
}
