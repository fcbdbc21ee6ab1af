//! Task execution: components run step by step against a browser page, one
//! data domain after another (or in isolated batches), with progress and the
//! final outcome written back through the guarded task store.

mod context;
mod criteria;
mod domain;
mod error;
mod parallel;
mod policy;
mod progress;
mod step;
mod verification;
mod worker;

pub use context::{classify_outcome, CollectionResult, DateRange, DomainKey, TaskContext};
pub use criteria::{
    run_error_handlers, run_pre_checks, url_accessible, verify_success_criteria, HandlerVerdict,
    PreCheckVerdict,
};
pub use domain::DomainIterator;
pub use error::{ExecutorError, ExecutorResult};
pub use parallel::ParallelDomainRunner;
pub use policy::{resolve_selector, with_fallbacks, Attempted, RetryOutcome, RetryPolicy, SmartWait};
pub use progress::{
    domain_progress, TaskProgress, PROGRESS_DOMAINS_START, PROGRESS_DONE, PROGRESS_FINISHING,
    PROGRESS_LOADING_LOGIN, PROGRESS_LOGGING_IN,
};
pub use step::{ComponentRun, RunScope, StepExecutor};
pub use verification::ChallengeDetector;
pub use worker::{CollectionWorker, Collaborators};
