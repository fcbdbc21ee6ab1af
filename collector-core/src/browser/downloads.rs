use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::task;
use tokio::time::{sleep, Instant};
use walkdir::WalkDir;

use super::error::{BrowserError, BrowserResult};

const PARTIAL_SUFFIXES: [&str; 3] = ["crdownload", "tmp", "part"];

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PARTIAL_SUFFIXES.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn list_files(dir: &Path) -> Vec<(PathBuf, SystemTime)> {
    WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.into_path(), modified)
        })
        .collect()
}

async fn scan(dir: &Path) -> BrowserResult<Vec<(PathBuf, SystemTime)>> {
    let dir = dir.to_path_buf();
    task::spawn_blocking(move || list_files(&dir))
        .await
        .map_err(|err| BrowserError::Io(err.into()))
}

/// Detects files that appear in a download directory after a baseline.
#[derive(Debug, Clone)]
pub struct DownloadWatcher {
    dir: PathBuf,
    baseline: HashSet<PathBuf>,
}

impl DownloadWatcher {
    pub async fn start(dir: impl AsRef<Path>) -> BrowserResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let baseline = scan(&dir).await?.into_iter().map(|(path, _)| path).collect();
        Ok(Self { dir, baseline })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Newest finished file not present at `start`, if the directory holds no
    /// in-progress download.
    pub async fn newest_completed(&self) -> BrowserResult<Option<PathBuf>> {
        let files = scan(&self.dir).await?;
        if files.iter().any(|(path, _)| is_partial(path)) {
            return Ok(None);
        }
        Ok(files
            .into_iter()
            .filter(|(path, _)| !self.baseline.contains(path))
            .max_by_key(|(_, modified)| *modified)
            .map(|(path, _)| path))
    }

    pub async fn wait_for_file(&self, timeout: Duration, poll: Duration) -> BrowserResult<PathBuf> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(path) = self.newest_completed().await? {
                return Ok(path);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BrowserError::Timeout(format!(
                    "download in {}",
                    self.dir.display()
                )));
            }
            sleep(poll.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn ignores_baseline_and_partial_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("old.csv"), b"a").unwrap();
        let watcher = DownloadWatcher::start(dir.path()).await.unwrap();
        assert_eq!(watcher.newest_completed().await.unwrap(), None);

        std::fs::write(dir.path().join("orders.csv.crdownload"), b"b").unwrap();
        assert_eq!(watcher.newest_completed().await.unwrap(), None);

        std::fs::rename(
            dir.path().join("orders.csv.crdownload"),
            dir.path().join("orders.csv"),
        )
        .unwrap();
        assert_eq!(
            watcher.newest_completed().await.unwrap(),
            Some(dir.path().join("orders.csv"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn picks_up_a_file_written_while_polling() {
        let dir = tempdir().unwrap();
        let watcher = DownloadWatcher::start(dir.path().join("nested")).await.unwrap();
        let target = watcher.dir().join("report.xlsx");
        let writer = {
            let target = target.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(300)).await;
                tokio::fs::write(target, b"data").await.unwrap();
            })
        };

        let found = watcher
            .wait_for_file(Duration::from_secs(5), Duration::from_millis(100))
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(found, target);
    }

    #[tokio::test]
    async fn times_out_without_new_files() {
        let dir = tempdir().unwrap();
        let watcher = DownloadWatcher::start(dir.path()).await.unwrap();
        let err = watcher
            .wait_for_file(Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
