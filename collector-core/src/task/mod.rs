mod admission;
mod error;
mod models;
mod store;

pub use admission::{EnqueueOutcome, TaskQueue, TaskReady};
pub use error::{TaskError, TaskResult};
pub use models::{
    FailedDomain, LogLevel, NewTask, Task, TaskFields, TaskFilter, TaskLogEntry, TaskStatus,
};
pub use store::{ClaimOutcome, SqliteTaskStore, SqliteTaskStoreBuilder};
