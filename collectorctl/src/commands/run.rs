use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use collector_core::browser::{AlwaysLogin, MarkerSessionDetector, SessionDetector};
use collector_core::{
    AccountBook, BrowserSession, ChromiumLauncher, ChromiumSession, CollectionResult,
    CollectionWorker, Collaborators, CollectorConfig, SelectorPopupDismisser, SqliteTaskStore,
    UsageStatsSelector, YamlComponentStore,
};
use tracing::{info, warn};

use crate::{AppError, Result};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Exit once no task is running or waiting instead of polling
    #[arg(long)]
    pub once: bool,
    /// Seconds between polls for new pending tasks
    #[arg(long, default_value_t = 10)]
    pub interval_secs: u64,
    /// Treat a session as live when this selector is present (`platform=selector`)
    #[arg(long = "session-marker")]
    pub session_markers: Vec<String>,
}

fn session_detector(markers: &[String]) -> Result<Arc<dyn SessionDetector>> {
    if markers.is_empty() {
        return Ok(Arc::new(AlwaysLogin));
    }
    let mut detector = MarkerSessionDetector::new(Duration::from_millis(1_500));
    for marker in markers {
        let (platform, selector) = marker.split_once('=').ok_or_else(|| {
            AppError::InvalidArgument(format!("session marker must be platform=selector: {marker}"))
        })?;
        detector = detector.marker(platform.trim(), selector.trim());
    }
    Ok(Arc::new(detector))
}

fn collaborators(
    config: &CollectorConfig,
    browser: Arc<ChromiumSession>,
    sessions: Arc<dyn SessionDetector>,
) -> Result<Collaborators> {
    let tasks_db = config.tasks_db();
    if !tasks_db.exists() {
        return Err(AppError::MissingResource(format!(
            "task database missing: {}",
            tasks_db.display()
        )));
    }
    let browser: Arc<dyn BrowserSession> = browser;
    Ok(Collaborators {
        store: SqliteTaskStore::new(tasks_db)?,
        components: Arc::new(YamlComponentStore::new(config.components_dir())),
        versions: Arc::new(UsageStatsSelector::new()),
        popups: Arc::new(SelectorPopupDismisser::new(&config.popups)),
        sessions,
        accounts: Arc::new(AccountBook::load(config.accounts_file())?),
        browser,
    })
}

async fn launch(config: &CollectorConfig) -> Result<Arc<ChromiumSession>> {
    let poll = Duration::from_millis(config.executor.poll_interval_ms);
    let session = ChromiumLauncher::new(config.chromium.clone(), poll)
        .launch()
        .await?;
    Ok(Arc::new(session))
}

async fn shutdown(browser: Arc<ChromiumSession>) {
    match Arc::try_unwrap(browser) {
        Ok(session) => {
            if let Err(err) = session.shutdown().await {
                warn!(error = %err, "chromium shutdown failed");
            }
        }
        Err(_) => warn!("chromium session still shared at shutdown"),
    }
}

/// Recovers orphaned rows, then admits and executes tasks until idle. Without
/// `--once` it keeps polling for new pending tasks until interrupted.
pub async fn run_worker(config: &CollectorConfig, args: &RunArgs) -> Result<Vec<CollectionResult>> {
    let browser = launch(config).await?;
    let worker = CollectionWorker::new(
        config.clone(),
        collaborators(config, Arc::clone(&browser), session_detector(&args.session_markers)?)?,
    );
    let recovered = worker.recover()?;
    info!(recovered, "worker started");

    let mut results = Vec::new();
    let outcome = loop {
        match worker.run_until_idle().await {
            Ok(batch) => results.extend(batch),
            Err(err) => break Err(AppError::from(err)),
        }
        if args.once {
            break Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.interval_secs.max(1))) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping worker");
                break Ok(());
            }
        }
    };

    drop(worker);
    shutdown(browser).await;
    outcome.map(|()| results)
}

pub async fn resume(config: &CollectorConfig, task_row_id: i64) -> Result<CollectionResult> {
    let browser = launch(config).await?;
    let worker = CollectionWorker::new(
        config.clone(),
        collaborators(config, Arc::clone(&browser), Arc::new(AlwaysLogin))?,
    );
    let outcome = worker.resume(task_row_id).await;
    drop(worker);
    shutdown(browser).await;
    Ok(outcome?)
}
