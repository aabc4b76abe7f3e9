//! Task records and the lifecycle they move through.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::progress::{CALCULATING, ProcessingStage, ProgressFacts};

/// Ceiling for the percentage while bytes are still arriving; the rest is
/// reserved for post-processing.
pub const DOWNLOAD_PROGRESS_CAP: f64 = 90.0;
const PROCESSING_PROGRESS_SPAN: f64 = 9.0;
const PROCESSING_PROGRESS_PER_SEC: f64 = 0.9;
const MIN_VISIBLE_PROGRESS: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenditionKind {
    Video,
    Audio,
    Thumbnail,
}

impl RenditionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Thumbnail => "thumbnail",
        }
    }

    /// Extensions the artifact may carry once the tool is done with it.
    pub fn expected_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Video => &["mp4", "webm", "mkv"],
            Self::Audio => &["mp3", "m4a", "opus", "webm"],
            Self::Thumbnail => &["png", "jpg", "jpeg", "webp"],
        }
    }
}

impl FromStr for RenditionKind {
    type Err = TaskError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "thumbnail" => Ok(Self::Thumbnail),
            _ => Err(TaskError::invalid_input(
                "Invalid format type. Must be 'video', 'audio', or 'thumbnail'",
            )),
        }
    }
}

impl fmt::Display for RenditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Starting,
    Downloading,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable inputs of a download request.
#[derive(Clone, Debug)]
pub struct TaskRequest {
    pub url: String,
    pub kind: RenditionKind,
    pub quality: String,
}

/// One tracked download. Fields that only become known later in the run are
/// optional; the live process handle is kept by the registry, not here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub source_url: String,
    pub rendition_kind: RenditionKind,
    pub quality: String,
    pub state: TaskState,
    pub progress: f64,
    pub speed: String,
    pub eta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_bytes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<f64>,
    /// Path announced by the tool while running; not yet verified on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_stage: Option<ProcessingStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: String, request: TaskRequest, work_dir: PathBuf) -> Self {
        Self {
            task_id,
            source_url: request.url,
            rendition_kind: request.kind,
            quality: request.quality,
            state: TaskState::Starting,
            progress: 0.0,
            speed: CALCULATING.to_string(),
            eta: CALCULATING.to_string(),
            speed_bytes: None,
            downloaded_bytes: None,
            total_bytes: None,
            destination: None,
            output_file: None,
            filename: None,
            mime_type: None,
            error: None,
            processing_stage: None,
            processing_started_at: None,
            work_dir,
            created_at: Utc::now(),
        }
    }

    /// Folds freshly parsed facts into the record.
    ///
    /// While downloading the percentage only moves forward and never passes
    /// [`DOWNLOAD_PROGRESS_CAP`]. A stage marker moves the task to
    /// `processing`.
    pub fn absorb(&mut self, facts: &ProgressFacts, now: DateTime<Utc>) {
        if facts.speed != CALCULATING {
            self.speed = facts.speed.clone();
        }
        if facts.speed_bytes.is_some() {
            self.speed_bytes = facts.speed_bytes;
        }
        if facts.downloaded_bytes.is_some() {
            self.downloaded_bytes = facts.downloaded_bytes;
        }
        if facts.total_bytes.is_some() {
            self.total_bytes = facts.total_bytes;
        }
        if facts.output_file.is_some() {
            self.destination = facts.output_file.clone();
        }

        match self.state {
            TaskState::Downloading => {
                self.eta = facts.eta.clone();
                let capped = facts.percent.clamp(0.0, DOWNLOAD_PROGRESS_CAP);
                self.progress = self.progress.max(capped);
                if let Some(stage) = facts.stage {
                    self.enter_processing(stage, now);
                }
            }
            TaskState::Processing => {
                if let Some(stage) = facts.stage {
                    self.processing_stage = Some(stage);
                }
            }
            _ => {}
        }
    }

    pub fn enter_processing(&mut self, stage: ProcessingStage, now: DateTime<Utc>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Processing;
        self.progress = self.progress.min(DOWNLOAD_PROGRESS_CAP);
        self.processing_stage.get_or_insert(stage);
        self.processing_started_at.get_or_insert(now);
        self.eta = stage.label().to_string();
    }

    pub fn complete(&mut self, artifact: &Artifact) {
        self.state = TaskState::Completed;
        self.progress = 100.0;
        self.speed = "Complete".to_string();
        self.eta = "Done".to_string();
        self.output_file = Some(artifact.path.clone());
        self.filename = Some(artifact.filename.clone());
        self.mime_type = Some(artifact.mime_type.clone());
        self.error = None;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = TaskState::Failed;
        self.error = Some(message.into());
    }

    /// The finished artifact, only once the task has completed.
    pub fn artifact(&self) -> Option<Artifact> {
        if self.state != TaskState::Completed {
            return None;
        }
        Some(Artifact {
            path: self.output_file.clone()?,
            filename: self.filename.clone()?,
            mime_type: self
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        })
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }

    /// Snapshot for pollers. Processing progress is derived from time spent in
    /// the stage so the bar keeps moving while the tool is silent.
    pub fn view(&self, now: DateTime<Utc>) -> ProgressView {
        let (progress, speed, eta) = match self.state {
            TaskState::Starting => (self.progress, self.speed.clone(), self.eta.clone()),
            TaskState::Downloading => (
                self.progress
                    .clamp(MIN_VISIBLE_PROGRESS, DOWNLOAD_PROGRESS_CAP),
                self.speed.clone(),
                self.eta.clone(),
            ),
            TaskState::Processing => {
                let since = self.processing_started_at.unwrap_or(self.created_at);
                let secs = (now - since).num_milliseconds().max(0) as f64 / 1000.0;
                let extra = (secs * PROCESSING_PROGRESS_PER_SEC).min(PROCESSING_PROGRESS_SPAN);
                let eta = self
                    .processing_stage
                    .map(|stage| stage.label().to_string())
                    .unwrap_or_else(|| "Processing...".to_string());
                (
                    DOWNLOAD_PROGRESS_CAP + extra,
                    "Processing...".to_string(),
                    eta,
                )
            }
            TaskState::Completed => (100.0, self.speed.clone(), self.eta.clone()),
            TaskState::Failed | TaskState::Canceled => {
                (self.progress, self.speed.clone(), self.eta.clone())
            }
        };

        ProgressView {
            status: self.state,
            progress,
            speed,
            eta,
            rendition_kind: self.rendition_kind,
            elapsed_seconds: self.elapsed_seconds(now),
            error: self.error.clone(),
        }
    }
}

/// What a poller sees. Computed per read, never stored.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressView {
    pub status: TaskState,
    pub progress: f64,
    pub speed: String,
    pub eta: String,
    #[serde(rename = "format_type")]
    pub rendition_kind: RenditionKind,
    #[serde(rename = "elapsed")]
    pub elapsed_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Location of a finished artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub filename: String,
    pub mime_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::parse_line;
    use chrono::Duration;

    fn record() -> TaskRecord {
        TaskRecord::new(
            "t1".into(),
            TaskRequest {
                url: "https://youtu.be/ABCDEFGHIJK".into(),
                kind: RenditionKind::Video,
                quality: "best".into(),
            },
            PathBuf::from("/tmp/t1"),
        )
    }

    #[test]
    fn rendition_kind_parsing() {
        assert_eq!("Video".parse::<RenditionKind>().unwrap(), RenditionKind::Video);
        assert_eq!(" audio ".parse::<RenditionKind>().unwrap(), RenditionKind::Audio);
        let err = "gif".parse::<RenditionKind>().unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Processing.is_terminal());
    }

    #[test]
    fn downloading_progress_is_monotonic_and_capped() {
        let mut rec = record();
        rec.state = TaskState::Downloading;
        let now = Utc::now();
        let mut facts = ProgressFacts::default();
        let mut seen = Vec::new();
        for line in [
            "[download]   5.0% of 10.00MiB at 1.00MiB/s ETA 00:09",
            "[download]  60.0% of 10.00MiB at 1.00MiB/s ETA 00:04",
            "[download]  99.0% of 10.00MiB at 1.00MiB/s ETA 00:00",
            "[download]   3.0% of 2.00MiB at 1.00MiB/s ETA 00:01",
            "[download] 100% of 2.00MiB in 00:00:02 at 1.00MiB/s",
        ] {
            facts = parse_line(line, &facts);
            rec.absorb(&facts, now);
            seen.push(rec.view(now).progress);
        }
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
        assert!(seen.iter().all(|value| *value <= DOWNLOAD_PROGRESS_CAP));
        assert_eq!(rec.state, TaskState::Downloading);
    }

    #[test]
    fn merge_marker_enters_processing() {
        let mut rec = record();
        rec.state = TaskState::Downloading;
        let start = Utc::now();
        let mut facts = parse_line("[download]  95.0% of 1.00MiB", &ProgressFacts::default());
        rec.absorb(&facts, start);
        facts = parse_line(r#"[Merger] Merging formats into "/tmp/t1/x.mp4""#, &facts);
        rec.absorb(&facts, start);

        assert_eq!(rec.state, TaskState::Processing);
        assert_eq!(rec.progress, DOWNLOAD_PROGRESS_CAP);
        assert_eq!(rec.destination, Some(PathBuf::from("/tmp/t1/x.mp4")));
        assert!(rec.output_file.is_none());

        let early = rec.view(start);
        let later = rec.view(start + Duration::seconds(3));
        let much_later = rec.view(start + Duration::seconds(60));
        assert_eq!(early.progress, DOWNLOAD_PROGRESS_CAP);
        assert!(later.progress > early.progress);
        assert!(much_later.progress >= later.progress);
        assert!(much_later.progress < 100.0);
        assert_eq!(later.eta, "Merging streams...");
        assert_eq!(later.speed, "Processing...");
    }

    #[test]
    fn completion_publishes_artifact() {
        let mut rec = record();
        rec.state = TaskState::Processing;
        assert!(rec.artifact().is_none());

        let artifact = Artifact {
            path: PathBuf::from("/tmp/t1/clip.mp4"),
            filename: "clip.mp4".into(),
            mime_type: "video/mp4".into(),
        };
        rec.complete(&artifact);
        let view = rec.view(Utc::now());
        assert_eq!(view.progress, 100.0);
        assert_eq!(view.speed, "Complete");
        assert_eq!(view.eta, "Done");
        assert_eq!(rec.artifact(), Some(artifact));
    }

    #[test]
    fn failed_record_keeps_message_and_no_artifact() {
        let mut rec = record();
        rec.fail("Download process exited with code 1");
        assert_eq!(rec.state, TaskState::Failed);
        assert!(rec.artifact().is_none());
        assert_eq!(
            rec.view(Utc::now()).error.as_deref(),
            Some("Download process exited with code 1")
        );
    }

    #[test]
    fn downloading_view_never_shows_zero() {
        let mut rec = record();
        rec.state = TaskState::Downloading;
        assert_eq!(rec.view(Utc::now()).progress, MIN_VISIBLE_PROGRESS);
    }

    #[test]
    fn view_serializes_with_wire_names() {
        let rec = record();
        let value = serde_json::to_value(rec.view(rec.created_at)).unwrap();
        assert_eq!(value["status"], "starting");
        assert_eq!(value["format_type"], "video");
        assert_eq!(value["elapsed"], 0);
        assert!(value.get("error").is_none());
    }
}
