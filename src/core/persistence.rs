//! Snapshot file persistence for the metrics aggregator.
//!
//! The snapshot is read once at startup and rewritten as a whole on every
//! flush. Writes go to a sibling temp file that is renamed over the target,
//! so a crash mid-write never leaves a truncated snapshot behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::core::analytics::{MetricsAggregator, MetricsSnapshot};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Read the snapshot at `path`, `Ok(None)` if there is none yet
pub async fn load_snapshot(path: &Path) -> Result<Option<MetricsSnapshot>, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Build the aggregator from the snapshot file, merged with the configured backends.
///
/// A missing or unreadable snapshot only costs the historical counters.
pub async fn restore_metrics(path: &Path, backends: &[String]) -> MetricsAggregator {
    match load_snapshot(path).await {
        Ok(Some(snapshot)) => {
            info!(
                "Restored metrics from {} ({} requests so far)",
                path.display(),
                snapshot.total_requests
            );
            MetricsAggregator::restore(snapshot, backends)
        }
        Ok(None) => {
            info!("No metrics snapshot at {}, starting fresh", path.display());
            MetricsAggregator::new(backends)
        }
        Err(e) => {
            warn!("Ignoring unreadable metrics snapshot {}: {}", path.display(), e);
            MetricsAggregator::new(backends)
        }
    }
}

/// Replace the file at `path` with `snapshot`
pub async fn write_snapshot(path: &Path, snapshot: &MetricsSnapshot) -> Result<(), PersistenceError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Debounced writer of the metrics snapshot
pub struct SnapshotFlusher {
    metrics: Arc<MetricsAggregator>,
    path: PathBuf,
    debounce: Duration,
}

impl SnapshotFlusher {
    pub fn new(metrics: Arc<MetricsAggregator>, path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            metrics,
            path: path.into(),
            debounce,
        }
    }

    /// Write the snapshot if anything changed since the last write
    pub async fn flush_now(&self) -> Result<bool, PersistenceError> {
        if !self.metrics.take_dirty() {
            return Ok(false);
        }
        if let Err(e) = write_snapshot(&self.path, &self.metrics.snapshot()).await {
            // Keep the changes pending for the next attempt
            self.metrics.mark_dirty();
            return Err(e);
        }
        debug!("Metrics snapshot written to {}", self.path.display());
        Ok(true)
    }

    /// Wait for a mutation, let further ones coalesce for the debounce
    /// window, then write once. Runs until aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.metrics.changed().await;
            tokio::time::sleep(self.debounce).await;
            if let Err(e) = self.flush_now().await {
                error!("Failed to persist metrics to {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backends() -> Vec<String> {
        vec!["http://a".to_string(), "http://b".to_string()]
    }

    #[tokio::test]
    async fn test_missing_snapshot_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let metrics = restore_metrics(&dir.path().join("stats.json"), &backends()).await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.load_distribution.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(load_snapshot(&path).await.is_err());
        let metrics = restore_metrics(&path, &backends()).await;
        assert_eq!(metrics.snapshot().total_requests, 0);
    }

    #[tokio::test]
    async fn test_flush_and_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        let metrics = Arc::new(MetricsAggregator::new(&backends()));
        let flusher = SnapshotFlusher::new(metrics.clone(), &path, Duration::from_millis(10));

        assert!(!flusher.flush_now().await.unwrap());
        metrics.record_request();
        metrics.record_attempt("http://a");
        assert!(flusher.flush_now().await.unwrap());
        assert!(!flusher.flush_now().await.unwrap());
        assert!(!dir.path().join("stats.json.tmp").exists());

        // Older snapshots may lack backends added to the configuration since
        let restored = restore_metrics(&path, &["http://a".to_string(), "http://c".to_string()]).await;
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.load_distribution["http://a"], 1);
        assert_eq!(snapshot.load_distribution["http://c"], 0);
    }

    #[tokio::test]
    async fn test_partial_snapshot_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        tokio::fs::write(&path, br#"{"totalRequests": 12}"#).await.unwrap();

        let snapshot = restore_metrics(&path, &backends()).await.snapshot();
        assert_eq!(snapshot.total_requests, 12);
        assert_eq!(snapshot.blocked_requests, 0);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_changes_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("stats.json");
        let metrics = Arc::new(MetricsAggregator::new(&backends()));
        let flusher = SnapshotFlusher::new(metrics.clone(), &path, Duration::from_millis(10));

        metrics.record_request();
        assert!(flusher.flush_now().await.is_err());
        assert!(metrics.take_dirty());
    }

    #[tokio::test]
    async fn test_debounced_flusher_coalesces_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        let metrics = Arc::new(MetricsAggregator::new(&backends()));
        let flusher = Arc::new(SnapshotFlusher::new(
            metrics.clone(),
            &path,
            Duration::from_millis(100),
        ));
        let task = tokio::spawn(flusher.clone().run());

        for _ in 0..50 {
            metrics.record_request();
        }
        tokio::task::yield_now().await;
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let snapshot = load_snapshot(&path).await.unwrap().unwrap();
        assert_eq!(snapshot.total_requests, 50);
        task.abort();
    }
}
