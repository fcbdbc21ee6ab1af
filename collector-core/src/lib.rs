pub mod account;
pub mod browser;
pub mod component;
pub mod config;
pub mod error;
pub mod executor;
pub mod sqlite;
pub mod task;

pub use account::{AccountBook, AccountProfile, AccountResolver};
pub use browser::{
    BrowserError, BrowserResult, BrowserSession, ChromiumLauncher, ChromiumSession, Page,
    PageContext, PopupDismisser, SelectorPopupDismisser, SessionDetector, SessionSnapshot,
};
pub use component::{
    Component, ComponentError, ComponentResult, ComponentStore, UsageStatsSelector,
    VersionSelector, YamlComponentStore,
};
pub use config::{load_collector_config, CollectorConfig};
pub use error::{ConfigError, Result};
pub use executor::{
    CollectionResult, CollectionWorker, Collaborators, DomainIterator, ExecutorError,
    ExecutorResult, ParallelDomainRunner, StepExecutor, TaskContext,
};
pub use task::{
    NewTask, SqliteTaskStore, SqliteTaskStoreBuilder, Task, TaskError, TaskFilter, TaskQueue,
    TaskResult, TaskStatus,
};
