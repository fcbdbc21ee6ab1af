use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use collector_core::task::{LogLevel, TaskFields, TaskLogEntry};
use collector_core::{
    load_collector_config, CollectionResult, CollectorConfig, SqliteTaskStore, Task, TaskFilter,
    TaskStatus,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

pub mod commands;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] collector_core::ConfigError),
    #[error("task store error: {0}")]
    Task(#[from] collector_core::TaskError),
    #[error("execution error: {0}")]
    Executor(#[from] collector_core::ExecutorError),
    #[error("browser error: {0}")]
    Browser(#[from] collector_core::BrowserError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Portal export collector control interface", long_about = None)]
pub struct Cli {
    /// Path to collector.toml
    #[arg(long, default_value = "configs/collector.toml")]
    pub config: PathBuf,
    /// Overrides paths.base_dir
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
    /// Overrides the task database location
    #[arg(long)]
    pub tasks_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Creates the working directories and the task database
    Init,
    /// Shows task counts per status
    Status,
    /// Marks tasks left running by a dead process as interrupted
    Recover,
    /// Task inspection and control
    #[command(subcommand)]
    Task(TaskCommands),
    /// Runs the worker loop against Chromium
    Run(commands::run::RunArgs),
    /// Prints shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Lists tasks, newest first
    List(TaskListArgs),
    /// Shows one task (row id or task id)
    Show { task: String },
    /// Prints a task's log entries
    Logs {
        task: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Cancels a task that has not finished
    Cancel { task: String },
    /// Resumes a task paused for verification
    Resume { task: String },
}

#[derive(Args, Debug)]
pub struct TaskListArgs {
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub account: Option<String>,
    #[arg(long)]
    pub platform: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "collectorctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Init => render(&context.init()?, cli.format)?,
        Commands::Status => render(&context.status()?, cli.format)?,
        Commands::Recover => render(&context.recover()?, cli.format)?,
        Commands::Task(TaskCommands::List(args)) => render(&context.task_list(args)?, cli.format)?,
        Commands::Task(TaskCommands::Show { task }) => {
            render(&TaskDetail(context.resolve_task(task)?), cli.format)?
        }
        Commands::Task(TaskCommands::Logs { task, limit }) => {
            render(&context.task_logs(task, *limit)?, cli.format)?
        }
        Commands::Task(TaskCommands::Cancel { task }) => {
            render(&context.cancel(task)?, cli.format)?
        }
        Commands::Task(TaskCommands::Resume { task }) => {
            let task = context.resolve_task(task)?;
            let result = commands::run::resume(&context.config, task.id).await?;
            render(&RunReport::from(vec![result]), cli.format)?
        }
        Commands::Run(args) => {
            let results = commands::run::run_worker(&context.config, args).await?;
            render(&RunReport::from(results), cli.format)?
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: CollectorConfig,
    config_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_collector_config(&cli.config)?;
        if let Some(base_dir) = &cli.base_dir {
            config.paths.base_dir = base_dir.to_string_lossy().into_owned();
        }
        if let Some(tasks_db) = &cli.tasks_db {
            config.paths.tasks_db = tasks_db.to_string_lossy().into_owned();
        }
        Ok(Self {
            config,
            config_path: cli.config.clone(),
        })
    }

    fn store(&self) -> Result<SqliteTaskStore> {
        let path = self.config.tasks_db();
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "task database missing: {} (run `collectorctl init`)",
                path.display()
            )));
        }
        Ok(SqliteTaskStore::new(path)?)
    }

    fn init(&self) -> Result<InitReport> {
        let directories = vec![
            self.config.components_dir(),
            self.config.downloads_dir(),
            self.config.screenshots_dir(),
        ];
        for dir in &directories {
            fs::create_dir_all(dir)?;
        }
        let tasks_db = self.config.tasks_db();
        SqliteTaskStore::builder()
            .path(&tasks_db)
            .create_if_missing(true)
            .build()?
            .initialize()?;
        Ok(InitReport {
            tasks_db,
            directories,
        })
    }

    fn status(&self) -> Result<StatusReport> {
        let store = self.store()?;
        Ok(StatusReport {
            config: self.config_path.clone(),
            tasks_db: self.config.tasks_db(),
            integrity: integrity_check(&self.config.tasks_db()),
            max_concurrent_tasks: self.config.admission.max_concurrent_tasks,
            counts: store.status_counts()?,
        })
    }

    fn recover(&self) -> Result<RecoverReport> {
        let interrupted = self.store()?.mark_interrupted_on_restart()?;
        Ok(RecoverReport { interrupted })
    }

    fn task_list(&self, args: &TaskListArgs) -> Result<TaskList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()?;
        let rows = self.store()?.list(&TaskFilter {
            status,
            account_id: args.account.clone(),
            platform: args.platform.clone(),
            limit: Some(args.limit),
        })?;
        Ok(TaskList { rows })
    }

    /// Accepts a numeric row id or a task id.
    fn resolve_task(&self, reference: &str) -> Result<Task> {
        let store = self.store()?;
        if let Ok(id) = reference.parse::<i64>() {
            return Ok(store.get(id)?);
        }
        store
            .find_by_task_id(reference)?
            .ok_or_else(|| AppError::InvalidArgument(format!("unknown task {reference}")))
    }

    fn task_logs(&self, reference: &str, limit: Option<usize>) -> Result<LogList> {
        let task = self.resolve_task(reference)?;
        let entries = self.store()?.logs(task.id, limit)?;
        Ok(LogList {
            task_id: task.task_id,
            entries,
        })
    }

    fn cancel(&self, reference: &str) -> Result<CancelReport> {
        let task = self.resolve_task(reference)?;
        if task.status.is_terminal() {
            return Err(AppError::InvalidArgument(format!(
                "task {} already finished as {}",
                task.task_id, task.status
            )));
        }
        let store = self.store()?;
        let version = store.update_status(
            task.id,
            TaskStatus::Cancelled,
            Some(task.version),
            Some(task.status),
            &TaskFields::default()
                .current_step("cancelled")
                .error_message("cancelled by operator"),
        )?;
        store.append_log(task.id, LogLevel::Warning, "cancelled by operator", None)?;
        Ok(CancelReport {
            task_id: task.task_id,
            previous: task.status,
            version,
        })
    }
}

fn integrity_check(path: &Path) -> String {
    match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => conn
            .query_row("PRAGMA integrity_check;", [], |row| row.get::<_, String>(0))
            .unwrap_or_else(|err| format!("error: {err}")),
        Err(err) => format!("failed to open: {err}"),
    }
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub tasks_db: PathBuf,
    pub directories: Vec<PathBuf>,
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("task database: {}", self.tasks_db.display())];
        for dir in &self.directories {
            lines.push(format!("  - {}", dir.display()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub config: PathBuf,
    pub tasks_db: PathBuf,
    pub integrity: String,
    pub max_concurrent_tasks: usize,
    pub counts: BTreeMap<String, i64>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("config: {}", self.config.display()),
            format!(
                "tasks: {} (integrity: {})",
                self.tasks_db.display(),
                self.integrity
            ),
            format!("max concurrent tasks: {}", self.max_concurrent_tasks),
        ];
        if self.counts.is_empty() {
            lines.push("no tasks".to_string());
        }
        for (status, count) in &self.counts {
            lines.push(format!("  - {status}: {count}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RecoverReport {
    pub interrupted: usize,
}

impl DisplayFallback for RecoverReport {
    fn display(&self) -> String {
        format!("{} task(s) marked interrupted", self.interrupted)
    }
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub rows: Vec<Task>,
}

impl DisplayFallback for TaskList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no tasks found".to_string();
        }
        self.rows
            .iter()
            .map(|task| {
                format!(
                    "{} | {} | {}/{} | {} | {}% | {}",
                    task.id,
                    task.task_id,
                    task.platform,
                    task.account_id,
                    task.status,
                    task.progress,
                    task.current_step.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct TaskDetail(pub Task);

impl DisplayFallback for TaskDetail {
    fn display(&self) -> String {
        let task = &self.0;
        let mut lines = vec![
            format!("{} (row {}, version {})", task.task_id, task.id, task.version),
            format!("account: {}/{}", task.platform, task.account_id),
            format!("status: {} ({}%)", task.status, task.progress),
            format!("dates: {} .. {} ({})", task.date_from, task.date_to, task.granularity),
            format!("domains: {}", task.data_domains.join(", ")),
        ];
        if let Some(subs) = &task.sub_domains {
            lines.push(format!("sub-domains: {}", subs.join(", ")));
        }
        if !task.completed_domains.is_empty() {
            lines.push(format!("completed: {}", task.completed_domains.join(", ")));
        }
        for failed in &task.failed_domains {
            lines.push(format!("failed: {} ({})", failed.domain, failed.error));
        }
        for file in &task.collected_files {
            lines.push(format!("file: {file}"));
        }
        if let Some(kind) = &task.verification_type {
            lines.push(format!(
                "verification: {kind} ({})",
                task.screenshot_path.as_deref().unwrap_or("no screenshot")
            ));
        }
        if let Some(error) = &task.error_message {
            lines.push(format!("error: {error}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct LogList {
    pub task_id: String,
    pub entries: Vec<TaskLogEntry>,
}

impl DisplayFallback for LogList {
    fn display(&self) -> String {
        if self.entries.is_empty() {
            return format!("no log entries for {}", self.task_id);
        }
        self.entries
            .iter()
            .map(|entry| {
                let at = entry
                    .created_at
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                format!("{at} [{}] {}", entry.level, entry.message)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CancelReport {
    pub task_id: String,
    pub previous: TaskStatus,
    pub version: i64,
}

impl DisplayFallback for CancelReport {
    fn display(&self) -> String {
        format!("{} cancelled (was {})", self.task_id, self.previous)
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub results: Vec<CollectionResult>,
}

impl From<Vec<CollectionResult>> for RunReport {
    fn from(results: Vec<CollectionResult>) -> Self {
        Self { results }
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        if self.results.is_empty() {
            return "no tasks executed".to_string();
        }
        self.results
            .iter()
            .map(|result| {
                format!(
                    "{} | {} | {}/{} domains | {} file(s) | {:.1}s{}",
                    result.task_id,
                    result.status,
                    result.completed_domains.len(),
                    result.total_domains,
                    result.files_collected,
                    result.duration_seconds,
                    result
                        .error_message
                        .as_deref()
                        .map(|error| format!(" | {error}"))
                        .unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
