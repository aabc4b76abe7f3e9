//! Shared task map guarded by a single lock, with JSON snapshot persistence.
//!
//! The lock is only ever held for one read or one field update. Subprocess I/O,
//! network calls and snapshot writes all happen outside it.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::task::{Artifact, ProgressView, TaskRecord, TaskRequest, TaskState};

pub const SNAPSHOT_FILE: &str = "downloads_state.json";

#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    storage_root: PathBuf,
    snapshot_path: PathBuf,
    // Serializes snapshot-then-write so an older snapshot never lands last.
    persist_lock: Mutex<()>,
}

struct TaskEntry {
    record: TaskRecord,
    cancel: CancellationToken,
    // Present only while a subprocess is running for this task.
    process: Option<ProcessHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
}

/// What the runner receives for a freshly created task.
#[derive(Clone, Debug)]
pub struct TaskTicket {
    pub task_id: String,
    pub work_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl TaskRegistry {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        let snapshot_path = storage_root.join(SNAPSHOT_FILE);
        Self {
            inner: Arc::new(RegistryInner {
                tasks: Mutex::new(HashMap::new()),
                storage_root,
                snapshot_path,
                persist_lock: Mutex::new(()),
            }),
        }
    }

    /// Rebuilds the registry from the snapshot under `storage_root`, if any.
    ///
    /// Records come back exactly as written. None of them refers to a live
    /// process, so tasks that were in flight stay where they were until the
    /// sweeper evicts them. A snapshot that cannot be read or parsed is moved
    /// aside and the registry starts empty.
    pub fn load(storage_root: impl Into<PathBuf>) -> Self {
        let registry = Self::new(storage_root);
        let path = registry.inner.snapshot_path.clone();
        let records = match read_snapshot(&path) {
            Ok(Some(records)) => records,
            Ok(None) => return registry,
            Err(err) => {
                error!(
                    error = %format!("{err:#}"),
                    path = %path.display(),
                    "discarding unreadable task snapshot"
                );
                let aside = path.with_extension("json.bad");
                if let Err(err) = fs::rename(&path, &aside) {
                    warn!(error = %err, "failed to move unreadable snapshot aside");
                }
                return registry;
            }
        };

        let mut stale = 0usize;
        {
            let mut tasks = registry.inner.tasks.lock();
            for (task_id, record) in records {
                if !record.state.is_terminal() {
                    stale += 1;
                }
                tasks.insert(
                    task_id,
                    TaskEntry {
                        record,
                        cancel: CancellationToken::new(),
                        process: None,
                    },
                );
            }
        }

        let total = registry.len();
        if stale > 0 {
            warn!(
                stale,
                "tasks interrupted by restart will not resume and wait for eviction"
            );
        }
        info!(total, path = %path.display(), "restored task registry");
        registry
    }

    pub fn storage_root(&self) -> &Path {
        &self.inner.storage_root
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.inner.snapshot_path
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create(&self, request: TaskRequest) -> TaskTicket {
        let task_id = Uuid::new_v4().to_string();
        let work_dir = self.inner.storage_root.join(&task_id);
        let cancel = CancellationToken::new();
        let record = TaskRecord::new(task_id.clone(), request, work_dir.clone());
        info!(
            task_id = %task_id,
            kind = %record.rendition_kind,
            quality = %record.quality,
            "task created"
        );

        self.inner.tasks.lock().insert(
            task_id.clone(),
            TaskEntry {
                record,
                cancel: cancel.clone(),
                process: None,
            },
        );
        self.persist_in_background();

        TaskTicket {
            task_id,
            work_dir,
            cancel,
        }
    }

    pub fn read(&self, task_id: &str) -> TaskResult<ProgressView> {
        self.read_at(task_id, Utc::now())
    }

    pub fn read_at(&self, task_id: &str, now: DateTime<Utc>) -> TaskResult<ProgressView> {
        self.inner
            .tasks
            .lock()
            .get(task_id)
            .map(|entry| entry.record.view(now))
            .ok_or_else(|| TaskError::not_found(task_id))
    }

    /// Copy of the stored record.
    pub fn record(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner
            .tasks
            .lock()
            .get(task_id)
            .map(|entry| entry.record.clone())
    }

    /// Artifact location once completed; `Ok(None)` means "not ready yet".
    pub fn artifact(&self, task_id: &str) -> TaskResult<Option<Artifact>> {
        self.inner
            .tasks
            .lock()
            .get(task_id)
            .map(|entry| entry.record.artifact())
            .ok_or_else(|| TaskError::not_found(task_id))
    }

    /// Flips a live task to `canceled` and signals its runner.
    ///
    /// Already-terminal tasks are left alone and still report `true`; unknown
    /// ids report `false`.
    pub fn cancel(&self, task_id: &str) -> bool {
        {
            let mut tasks = self.inner.tasks.lock();
            let Some(entry) = tasks.get_mut(task_id) else {
                return false;
            };
            if entry.record.state.is_terminal() {
                return true;
            }
            entry.record.state = TaskState::Canceled;
            entry.cancel.cancel();
        }
        info!(task_id, "task canceled");
        self.persist_in_background();
        true
    }

    /// Applies `update` to a non-terminal record.
    ///
    /// Returns `false` without touching anything when the record is gone or
    /// already terminal, so a late runner write never overrides a cancel.
    pub fn update(&self, task_id: &str, update: impl FnOnce(&mut TaskRecord)) -> bool {
        let mut tasks = self.inner.tasks.lock();
        match tasks.get_mut(task_id) {
            Some(entry) if !entry.record.state.is_terminal() => {
                update(&mut entry.record);
                true
            }
            _ => false,
        }
    }

    /// Like [`update`](Self::update) and persists when the write went through.
    pub fn transition(&self, task_id: &str, update: impl FnOnce(&mut TaskRecord)) -> bool {
        let applied = self.update(task_id, update);
        if applied {
            self.persist_in_background();
        }
        applied
    }

    pub fn attach_process(&self, task_id: &str, pid: Option<u32>) -> bool {
        let mut tasks = self.inner.tasks.lock();
        match tasks.get_mut(task_id) {
            Some(entry) if !entry.record.state.is_terminal() => {
                entry.process = Some(ProcessHandle { pid });
                true
            }
            _ => false,
        }
    }

    pub fn detach_process(&self, task_id: &str) {
        if let Some(entry) = self.inner.tasks.lock().get_mut(task_id) {
            entry.process = None;
        }
    }

    pub fn process(&self, task_id: &str) -> Option<ProcessHandle> {
        self.inner
            .tasks
            .lock()
            .get(task_id)
            .and_then(|entry| entry.process)
    }

    /// Drops the record; a still-running subprocess is told to stop.
    pub fn remove(&self, task_id: &str) -> Option<TaskRecord> {
        let entry = self.inner.tasks.lock().remove(task_id)?;
        if entry.process.is_some() {
            entry.cancel.cancel();
        }
        debug!(task_id, "task removed from registry");
        Some(entry.record)
    }

    /// Tasks older than `max_age`, with their working directories.
    pub fn expired(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<(String, PathBuf)> {
        self.inner
            .tasks
            .lock()
            .values()
            .filter(|entry| now - entry.record.created_at > max_age)
            .map(|entry| (entry.record.task_id.clone(), entry.record.work_dir.clone()))
            .collect()
    }

    /// Ids of tasks that may still write into their working directory.
    pub fn active_ids(&self) -> HashSet<String> {
        self.inner
            .tasks
            .lock()
            .values()
            .filter(|entry| !entry.record.state.is_terminal())
            .map(|entry| entry.record.task_id.clone())
            .collect()
    }

    pub fn persist(&self) -> Result<()> {
        let _guard = self.inner.persist_lock.lock();
        let snapshot: BTreeMap<String, TaskRecord> = self
            .inner
            .tasks
            .lock()
            .iter()
            .map(|(task_id, entry)| (task_id.clone(), entry.record.clone()))
            .collect();
        write_json_atomic(&self.inner.snapshot_path, &snapshot)
    }

    /// Persists on the blocking pool when a runtime is available, inline
    /// otherwise. Failures are logged, never returned.
    pub fn persist_in_background(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.clone();
                handle.spawn_blocking(move || registry.persist_logged());
            }
            Err(_) => self.persist_logged(),
        }
    }

    fn persist_logged(&self) {
        if let Err(err) = self.persist() {
            warn!(error = %err, "failed to persist task registry");
        }
    }
}

fn read_snapshot(path: &Path) -> Result<Option<BTreeMap<String, TaskRecord>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let records =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(records))
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressFacts, parse_line};
    use crate::task::RenditionKind;
    use tempfile::tempdir;

    fn request(kind: RenditionKind) -> TaskRequest {
        TaskRequest {
            url: "https://youtu.be/ABCDEFGHIJK".into(),
            kind,
            quality: "best".into(),
        }
    }

    #[test]
    fn create_then_read() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let ticket = registry.create(request(RenditionKind::Audio));

        assert_eq!(ticket.work_dir, dir.path().join(&ticket.task_id));
        let view = registry.read(&ticket.task_id).unwrap();
        assert_eq!(view.status, TaskState::Starting);
        assert_eq!(view.rendition_kind, RenditionKind::Audio);
        assert!(registry.snapshot_path().exists());
    }

    #[test]
    fn unknown_ids() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        assert!(matches!(
            registry.read("ghost"),
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(
            registry.artifact("ghost"),
            Err(TaskError::NotFound(_))
        ));
        assert!(!registry.cancel("ghost"));
    }

    #[test]
    fn artifact_is_none_until_completed() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let ticket = registry.create(request(RenditionKind::Video));
        assert_eq!(registry.artifact(&ticket.task_id).unwrap(), None);

        let artifact = Artifact {
            path: ticket.work_dir.join("clip.mp4"),
            filename: "clip.mp4".into(),
            mime_type: "video/mp4".into(),
        };
        assert!(registry.update(&ticket.task_id, |record| record.complete(&artifact)));
        assert_eq!(registry.artifact(&ticket.task_id).unwrap(), Some(artifact));
    }

    #[test]
    fn cancel_is_idempotent_and_wins_over_late_writes() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let ticket = registry.create(request(RenditionKind::Video));
        registry.update(&ticket.task_id, |record| {
            record.state = TaskState::Downloading
        });
        registry.attach_process(&ticket.task_id, Some(4242));

        assert!(registry.cancel(&ticket.task_id));
        assert!(ticket.cancel.is_cancelled());
        assert!(registry.cancel(&ticket.task_id));

        let late = registry.update(&ticket.task_id, |record| record.fail("exit code 143"));
        assert!(!late);
        assert!(!registry.attach_process(&ticket.task_id, Some(1)));
        let view = registry.read(&ticket.task_id).unwrap();
        assert_eq!(view.status, TaskState::Canceled);
        assert!(view.error.is_none());
    }

    #[test]
    fn cancel_leaves_terminal_tasks_alone() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let ticket = registry.create(request(RenditionKind::Audio));
        registry.update(&ticket.task_id, |record| record.fail("boom"));

        assert!(registry.cancel(&ticket.task_id));
        assert_eq!(
            registry.read(&ticket.task_id).unwrap().status,
            TaskState::Failed
        );
        assert!(!ticket.cancel.is_cancelled());
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let done = registry.create(request(RenditionKind::Video));
        let running = registry.create(request(RenditionKind::Audio));

        registry.update(&done.task_id, |record| {
            record.state = TaskState::Downloading;
            let facts = parse_line(
                "[download]  50.0% 1.00MiB of 2.00MiB at 1.00MiB/s ETA 00:01",
                &ProgressFacts::default(),
            );
            record.absorb(&facts, Utc::now());
            record.complete(&Artifact {
                path: done.work_dir.join("a.mp4"),
                filename: "a.mp4".into(),
                mime_type: "video/mp4".into(),
            });
        });
        registry.update(&running.task_id, |record| {
            record.state = TaskState::Downloading;
        });
        registry.attach_process(&running.task_id, Some(99));
        registry.persist().unwrap();

        let reloaded = TaskRegistry::load(dir.path());
        assert_eq!(reloaded.len(), 2);
        for id in [&done.task_id, &running.task_id] {
            assert_eq!(reloaded.record(id), registry.record(id));
        }
        assert_eq!(reloaded.process(&running.task_id), None);
        assert_eq!(
            reloaded.read(&running.task_id).unwrap().status,
            TaskState::Downloading
        );
    }

    #[test]
    fn reload_keeps_fractional_progress_exact() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let mut ids = Vec::new();
        let lines = [
            "[download]  42.0% of 50.62MiB at 499.80KiB/s ETA 01:02",
            "[download]  20.2% of 101.00MiB at 3.33MiB/s ETA 00:24",
            "[download]  67.3% of ~ 7.77GiB at 12.34KiB/s ETA 12:34",
        ];
        for (index, line) in lines.iter().enumerate() {
            let ticket = registry.create(request(RenditionKind::Video));
            registry.update(&ticket.task_id, |record| {
                record.state = TaskState::Downloading;
                let facts = parse_line(line, &ProgressFacts::default());
                record.absorb(&facts, Utc::now());
                record.progress = 100.0 * (index as f64 + 1.0) / 4.95;
            });
            ids.push(ticket.task_id);
        }
        registry.persist().unwrap();

        let reloaded = TaskRegistry::load(dir.path());
        for id in &ids {
            assert_eq!(reloaded.record(id), registry.record(id));
        }
    }

    #[test]
    fn unreadable_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let snapshot = dir.path().join(SNAPSHOT_FILE);
        fs::write(&snapshot, r#"{"x":{}}"#).unwrap();

        let registry = TaskRegistry::load(dir.path());

        assert!(registry.is_empty());
        assert!(!snapshot.exists());
        assert!(dir.path().join("downloads_state.json.bad").exists());

        let ticket = registry.create(request(RenditionKind::Audio));
        assert!(TaskRegistry::load(dir.path()).record(&ticket.task_id).is_some());
    }

    #[test]
    fn load_without_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::load(dir.path());
        assert!(registry.is_empty());
    }

    #[test]
    fn expired_and_remove() {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path());
        let old = registry.create(request(RenditionKind::Video));
        let fresh = registry.create(request(RenditionKind::Video));
        registry.update(&old.task_id, |record| {
            record.created_at = Utc::now() - Duration::hours(2);
        });

        let expired = registry.expired(Duration::hours(1), Utc::now());
        assert_eq!(expired, vec![(old.task_id.clone(), old.work_dir.clone())]);

        registry.attach_process(&old.task_id, None);
        assert!(registry.remove(&old.task_id).is_some());
        assert!(old.cancel.is_cancelled());
        assert!(registry.record(&old.task_id).is_none());
        assert!(registry.active_ids().contains(&fresh.task_id));
    }
}
