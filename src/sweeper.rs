//! Retention Sweeper: evicts old tasks and reclaims empty task directories.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::Settings, registry::TaskRegistry};

#[derive(Clone)]
pub struct RetentionSweeper {
    registry: TaskRegistry,
    max_age: Duration,
    interval: Duration,
}

/// What one pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub empty_dirs: usize,
}

impl RetentionSweeper {
    pub fn new(registry: TaskRegistry, settings: &Settings) -> Self {
        Self::with_limits(registry, settings.task_max_age, settings.sweep_interval)
    }

    pub fn with_limits(registry: TaskRegistry, max_age: Duration, interval: Duration) -> Self {
        Self {
            registry,
            max_age,
            interval,
        }
    }

    /// Sweeps every `interval` until `shutdown` fires. The first pass runs
    /// immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            max_age_secs = self.max_age.as_secs(),
            interval_secs = self.interval.as_secs(),
            "retention sweeper started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sweeper = self.clone();
            match tokio::task::spawn_blocking(move || sweeper.sweep(Utc::now())).await {
                Ok(report) if report != SweepReport::default() => {
                    info!(expired = report.expired, empty_dirs = report.empty_dirs, "sweep finished");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "sweep pass panicked"),
            }
        }
        debug!("retention sweeper stopped");
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        SweepReport {
            expired: self.sweep_expired(now),
            empty_dirs: self.sweep_empty_dirs(),
        }
    }

    /// Deletes tasks older than the retention threshold together with their
    /// directories, then persists the registry once.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        let expired = self.registry.expired(max_age, now);
        if expired.is_empty() {
            return 0;
        }

        for (task_id, work_dir) in &expired {
            self.registry.remove(task_id);
            if let Err(err) = remove_task_dir(work_dir) {
                warn!(task_id = %task_id, error = %err, "failed to delete expired task directory");
            }
            info!(task_id = %task_id, "evicted expired task");
        }
        if let Err(err) = self.registry.persist() {
            warn!(error = %err, "failed to persist registry after eviction");
        }
        expired.len()
    }

    /// Removes empty directories directly under the storage root. Directories
    /// of tasks that are still running are left alone.
    pub fn sweep_empty_dirs(&self) -> usize {
        let root = self.registry.storage_root();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "cannot scan storage root");
                return 0;
            }
        };
        let active = self.registry.active_ids();

        let candidates: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
            .filter(|entry| !active.contains(entry.file_name().to_string_lossy().as_ref()))
            .map(|entry| entry.path())
            .collect();

        let mut removed = 0;
        for dir in candidates {
            // remove_dir refuses non-empty directories, so a file landing
            // between the check and the call is never lost.
            if fs::remove_dir(&dir).is_ok() {
                debug!(dir = %dir.display(), "removed empty task directory");
                removed += 1;
            }
        }
        removed
    }
}

/// Recursively deletes a task directory. Already gone counts as success.
pub fn remove_task_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
