//! Download Task Runner: drives one task from `starting` to a terminal state.
//!
//! Each task runs on its own tokio task. The runner only talks to the world
//! through the registry, so a `canceled` written by a request handler always
//! wins over whatever the runner tries to write afterwards.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use mime_guess::MimeGuess;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    time::timeout,
};
use tracing::{debug, error, info, warn};
use url::Url;
use walkdir::WalkDir;

use crate::{
    config::{Settings, ToolPaths},
    cookies::{CookieFile, CookieProvider, provider_from_settings},
    error::{TaskError, TaskResult},
    metadata::MetadataFetcher,
    progress::{ProcessingStage, ProgressFacts, parse_line},
    registry::{TaskRegistry, TaskTicket},
    task::{Artifact, RenditionKind, TaskRequest, TaskState},
    validate::is_valid_video_url,
};

const DEFAULT_QUALITY: &str = "best";
const BEST_HEIGHT_CAP: u32 = 1440;
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(30);
const THUMBNAIL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp"];

/// Launches downloads and owns their background execution.
#[derive(Clone)]
pub struct DownloadRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    registry: TaskRegistry,
    tools: ToolPaths,
    proxy: Option<String>,
    fetcher: Arc<MetadataFetcher>,
    cookies: Arc<dyn CookieProvider>,
    http: ureq::Agent,
}

impl DownloadRunner {
    pub fn new(
        registry: TaskRegistry,
        settings: &Settings,
        fetcher: Arc<MetadataFetcher>,
        cookies: Arc<dyn CookieProvider>,
    ) -> Self {
        let mut builder = ureq::AgentBuilder::new().timeout(THUMBNAIL_TIMEOUT);
        if let Some(proxy) = &settings.proxy_url {
            match ureq::Proxy::new(proxy) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => warn!(error = %err, "ignoring unusable proxy for thumbnail downloads"),
            }
        }
        Self {
            inner: Arc::new(RunnerInner {
                registry,
                tools: settings.tools.clone(),
                proxy: settings.proxy_url.clone(),
                fetcher,
                cookies,
                http: builder.build(),
            }),
        }
    }

    /// Wires the metadata fetcher and cookie provider the settings describe.
    pub fn from_settings(registry: TaskRegistry, settings: &Settings) -> Self {
        Self::new(
            registry,
            settings,
            Arc::new(MetadataFetcher::from_settings(settings)),
            provider_from_settings(settings),
        )
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn fetcher(&self) -> Arc<MetadataFetcher> {
        Arc::clone(&self.inner.fetcher)
    }

    /// Validates the request, registers the task and starts it in the
    /// background. Must be called from within a tokio runtime.
    pub fn start(&self, url: &str, kind: &str, quality: Option<&str>) -> TaskResult<String> {
        let url = url.trim();
        if !is_valid_video_url(url) {
            return Err(TaskError::invalid_input("Invalid YouTube URL"));
        }
        let kind: RenditionKind = kind.parse()?;
        let quality = quality
            .map(str::trim)
            .filter(|quality| !quality.is_empty())
            .unwrap_or(DEFAULT_QUALITY);

        let request = TaskRequest {
            url: url.to_string(),
            kind,
            quality: quality.to_string(),
        };
        let ticket = self.inner.registry.create(request.clone());
        let task_id = ticket.task_id.clone();
        tokio::spawn(self.clone().run(ticket, request));
        Ok(task_id)
    }

    async fn run(self, ticket: TaskTicket, request: TaskRequest) {
        let task_id = ticket.task_id.as_str();
        let outcome = match request.kind {
            RenditionKind::Thumbnail => self.fetch_thumbnail(&ticket, &request).await,
            RenditionKind::Video | RenditionKind::Audio => {
                self.download_media(&ticket, &request).await
            }
        };

        let registry = &self.inner.registry;
        match outcome {
            Ok(artifact) => {
                if registry.transition(task_id, |record| record.complete(&artifact)) {
                    info!(task_id, file = %artifact.filename, "download completed");
                }
            }
            Err(TaskError::Canceled) => info!(task_id, "download canceled"),
            Err(err) => {
                let message = err.to_string();
                if registry.transition(task_id, |record| record.fail(message.clone())) {
                    error!(task_id, kind = err.kind(), error = %message, "download failed");
                }
            }
        }
    }

    async fn download_media(
        &self,
        ticket: &TaskTicket,
        request: &TaskRequest,
    ) -> TaskResult<Artifact> {
        let task_id = ticket.task_id.as_str();
        let registry = &self.inner.registry;
        let tools = &self.inner.tools;

        tokio::fs::create_dir_all(&ticket.work_dir).await?;
        self.probe_processing_tool().await?;
        let cookie = self.acquire_cookies(&request.url).await;
        if ticket.cancel.is_cancelled() {
            return Err(TaskError::Canceled);
        }

        let args = build_command(
            request.kind,
            &request.quality,
            &ticket.work_dir,
            tools,
            cookie.as_ref().map(CookieFile::path),
            self.inner.proxy.as_deref(),
            &request.url,
        );
        debug!(task_id, ?args, "launching extractor");
        let mut child = Command::new(&tools.ytdlp)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| launch_error(&tools.ytdlp, &err))?;

        if !registry.attach_process(task_id, child.id()) {
            terminate(&mut child, task_id).await;
            return Err(TaskError::Canceled);
        }
        registry.transition(task_id, |record| {
            if record.state == TaskState::Starting {
                record.state = TaskState::Downloading;
            }
        });
        info!(task_id, pid = ?child.id(), "download started");

        let stderr_tail = child.stderr.take().map(|stderr| {
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                let mut last = None;
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id = %task_id, line = %line, "extractor stderr");
                    let line = line.trim();
                    if !line.is_empty() {
                        last = Some(line.to_string());
                    }
                }
                last
            })
        });

        let mut canceled = false;
        if let Some(stdout) = child.stdout.take() {
            let mut facts = ProgressFacts::default();
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = ticket.cancel.cancelled() => {
                        canceled = true;
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            debug!(task_id, line = %line, "extractor output");
                            facts = parse_line(&line, &facts);
                            let now = Utc::now();
                            registry.update(task_id, |record| record.absorb(&facts, now));
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(task_id, error = %err, "reading extractor output failed");
                            break;
                        }
                    }
                }
            }
        }

        let status = if canceled {
            terminate(&mut child, task_id).await;
            None
        } else {
            wait_for_exit(&mut child, &ticket.cancel, task_id).await
        };
        registry.detach_process(task_id);
        drop(cookie);
        let tail = match stderr_tail {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };

        if ticket.cancel.is_cancelled() {
            return Err(TaskError::Canceled);
        }
        let status = match status {
            Some(Ok(status)) => status,
            Some(Err(err)) => return Err(TaskError::Io(err)),
            None => return Err(TaskError::Canceled),
        };
        if !status.success() {
            return Err(TaskError::SubprocessFailure(exit_message(status, tail)));
        }

        let stage = match request.kind {
            RenditionKind::Audio => ProcessingStage::Converting,
            _ => ProcessingStage::Merging,
        };
        let now = Utc::now();
        registry.update(task_id, |record| record.enter_processing(stage, now));

        let destination = registry
            .record(task_id)
            .and_then(|record| record.destination);
        let path = locate_artifact(
            &ticket.work_dir,
            destination.as_deref(),
            request.kind.expected_extensions(),
        )
        .ok_or_else(|| {
            TaskError::ArtifactNotFound("Download completed but file not found".to_string())
        })?;
        Ok(artifact_for(path))
    }

    async fn fetch_thumbnail(
        &self,
        ticket: &TaskTicket,
        request: &TaskRequest,
    ) -> TaskResult<Artifact> {
        let task_id = ticket.task_id.as_str();
        tokio::fs::create_dir_all(&ticket.work_dir).await?;

        let fetcher = Arc::clone(&self.inner.fetcher);
        let url = request.url.clone();
        let info = tokio::task::spawn_blocking(move || fetcher.get_video_info(&url))
            .await
            .map_err(join_error)??;
        let thumbnail_url = info
            .best_thumbnail_url()
            .ok_or_else(|| {
                TaskError::ArtifactNotFound("No thumbnails found for this video".to_string())
            })?
            .to_string();

        let ext = thumbnail_extension(&thumbnail_url);
        let target = ticket
            .work_dir
            .join(thumbnail_file_name(&info.title, ext));
        debug!(task_id, url = %thumbnail_url, path = %target.display(), "fetching thumbnail");

        let agent = self.inner.http.clone();
        let destination = target.clone();
        tokio::task::spawn_blocking(move || download_to(&agent, &thumbnail_url, &destination))
            .await
            .map_err(join_error)??;
        if ticket.cancel.is_cancelled() {
            return Err(TaskError::Canceled);
        }

        let path = if ext == "png" {
            target
        } else {
            self.normalize_thumbnail(task_id, target).await
        };
        Ok(artifact_for(path))
    }

    /// Converts a thumbnail to PNG. On any failure the original image is kept.
    async fn normalize_thumbnail(&self, task_id: &str, source: PathBuf) -> PathBuf {
        let target = source.with_extension("png");
        let status = Command::new(&self.inner.tools.ffmpeg)
            .arg("-i")
            .arg(&source)
            .arg("-y")
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                repair_double_extension(&target);
                if !target.is_file() {
                    warn!(task_id, "thumbnail conversion produced no file; keeping original");
                    return source;
                }
                if let Err(err) = tokio::fs::remove_file(&source).await {
                    debug!(task_id, error = %err, "could not remove unconverted thumbnail");
                }
                target
            }
            Ok(status) => {
                warn!(task_id, %status, "thumbnail conversion failed; keeping original");
                source
            }
            Err(err) => {
                warn!(task_id, error = %err, "could not launch ffmpeg; keeping original thumbnail");
                source
            }
        }
    }

    async fn probe_processing_tool(&self) -> TaskResult<()> {
        let ffmpeg = &self.inner.tools.ffmpeg;
        Command::new(ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|_| ())
            .map_err(|err| launch_error(ffmpeg, &err))
    }

    async fn acquire_cookies(&self, url: &str) -> Option<CookieFile> {
        let provider = Arc::clone(&self.inner.cookies);
        let url = url.to_string();
        match tokio::task::spawn_blocking(move || provider.acquire(&url)).await {
            Ok(cookie) => cookie,
            Err(err) => {
                warn!(error = %err, "cookie provider panicked");
                None
            }
        }
    }
}

/// Waits for the child to exit, still honouring a cancel that arrives after
/// its output closed.
async fn wait_for_exit(
    child: &mut Child,
    cancel: &tokio_util::sync::CancellationToken,
    task_id: &str,
) -> Option<io::Result<ExitStatus>> {
    tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => {
            terminate(child, task_id).await;
            None
        }
    }
}

/// SIGTERM, then SIGKILL if the process is still around after the grace
/// period.
async fn terminate(child: &mut Child, task_id: &str) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                if timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
                    debug!(task_id, pid, "extractor terminated");
                    return;
                }
                warn!(task_id, pid, "extractor ignored SIGTERM; killing");
            }
            Err(err) => debug!(task_id, pid, error = %err, "SIGTERM failed"),
        }
    }
    if let Err(err) = child.kill().await {
        debug!(task_id, error = %err, "extractor already gone");
    }
}

fn launch_error(tool: &Path, err: &io::Error) -> TaskError {
    if err.kind() == io::ErrorKind::NotFound {
        TaskError::ToolMissing(format!("{} not found", tool.display()))
    } else {
        TaskError::ToolMissing(format!("failed to launch {}: {err}", tool.display()))
    }
}

fn join_error(err: tokio::task::JoinError) -> TaskError {
    TaskError::Io(io::Error::other(err))
}

fn exit_message(status: ExitStatus, tail: Option<String>) -> String {
    let code = status
        .code()
        .map_or_else(|| "signal".to_string(), |code| code.to_string());
    match tail {
        Some(tail) => format!("Download process exited with code {code}: {tail}"),
        None => format!("Download process exited with code {code}"),
    }
}

/// Maps a requested quality to an extractor format selector.
///
/// `best`, `{H}p` and `{W}x{H}` become height-capped selectors; anything else
/// is taken as a format id from the rendition list.
pub fn format_selector(quality: &str) -> String {
    let quality = quality.trim();
    let capped = |height: u32| format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]");

    if quality.is_empty() || quality.eq_ignore_ascii_case(DEFAULT_QUALITY) {
        return capped(BEST_HEIGHT_CAP);
    }
    if let Some(height) = quality
        .strip_suffix('p')
        .and_then(|height| height.parse::<u32>().ok())
    {
        return capped(height);
    }
    if let Some((width, height)) = quality.split_once('x')
        && width.parse::<u32>().is_ok()
        && let Ok(height) = height.parse::<u32>()
    {
        return capped(height);
    }
    quality.to_string()
}

/// Full extractor argument list for a video or audio download.
pub fn build_command(
    kind: RenditionKind,
    quality: &str,
    work_dir: &Path,
    tools: &ToolPaths,
    cookie_file: Option<&Path>,
    proxy: Option<&str>,
    url: &str,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(location) = &tools.ffmpeg_location {
        args.push("--ffmpeg-location".into());
        args.push(location.into());
    }

    match kind {
        RenditionKind::Audio => {
            for arg in [
                "-f",
                "bestaudio",
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "0",
                "--postprocessor-args",
                "-codec:a libmp3lame -q:a 0",
            ] {
                args.push(arg.into());
            }
        }
        RenditionKind::Video | RenditionKind::Thumbnail => {
            args.push("-f".into());
            args.push(format_selector(quality).into());
            args.push("--recode-video".into());
            args.push("mp4".into());
        }
    }

    args.push("--no-playlist".into());
    args.push("-o".into());
    args.push(work_dir.join("%(title)s.%(ext)s").into());
    args.push("--newline".into());
    if let Some(cookie_file) = cookie_file {
        args.push("--cookies".into());
        args.push(cookie_file.into());
    }
    if let Some(proxy) = proxy {
        args.push("--proxy".into());
        args.push(proxy.into());
    }
    args.push(url.into());
    args
}

/// Finds the finished file for a task.
///
/// Tries the path the extractor announced (and its siblings with an expected
/// extension, since recoding changes the extension), then any file in the
/// work directory with an expected extension, then the largest leftover.
pub fn locate_artifact(
    work_dir: &Path,
    destination: Option<&Path>,
    extensions: &[&str],
) -> Option<PathBuf> {
    if let Some(destination) = destination {
        if destination.is_file() && !is_partial(destination) {
            return Some(destination.to_path_buf());
        }
        if let Some(found) = extensions
            .iter()
            .map(|ext| destination.with_extension(ext))
            .find(|candidate| candidate.is_file())
        {
            return Some(found);
        }
    }

    let files: Vec<(PathBuf, u64)> = WalkDir::new(work_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| !is_partial(entry.path()))
        .map(|entry| {
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            (entry.into_path(), size)
        })
        .collect();

    largest(files.iter().filter(|(path, _)| has_extension(path, extensions)))
        .or_else(|| largest(files.iter()))
}

fn largest<'a>(candidates: impl Iterator<Item = &'a (PathBuf, u64)>) -> Option<PathBuf> {
    candidates
        .max_by_key(|(_, size)| *size)
        .map(|(path, _)| path.clone())
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}

fn is_partial(path: &Path) -> bool {
    let name = path.to_string_lossy();
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn artifact_for(path: PathBuf) -> Artifact {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime_type = MimeGuess::from_path(&path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Artifact {
        path,
        filename,
        mime_type,
    }
}

/// Image extension from a thumbnail URL, `jpg` when unrecognised.
pub fn thumbnail_extension(url: &str) -> &'static str {
    let ext = Url::parse(url)
        .ok()
        .and_then(|url| {
            Path::new(url.path())
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        })
        .unwrap_or_default();
    THUMBNAIL_EXTENSIONS
        .iter()
        .find(|known| **known == ext)
        .copied()
        .unwrap_or("jpg")
}

pub fn thumbnail_file_name(title: &str, ext: &str) -> String {
    let safe: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect();
    let safe = safe.trim();
    let safe = if safe.is_empty() { "video" } else { safe };
    format!("{safe}_thumbnail.{ext}")
}

// The conversion tool sometimes appends its own extension to ours.
fn repair_double_extension(target: &Path) {
    let Some(name) = target.file_name() else {
        return;
    };
    let doubled = target.with_file_name(format!("{}.png", name.to_string_lossy()));
    if !target.exists()
        && doubled.is_file()
        && let Err(err) = std::fs::rename(&doubled, target)
    {
        warn!(error = %err, path = %doubled.display(), "could not repair thumbnail name");
    }
}

fn download_to(agent: &ureq::Agent, url: &str, target: &Path) -> TaskResult<()> {
    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => {
            return Err(TaskError::Http(format!(
                "Thumbnail request failed with status {code}"
            )));
        }
        Err(err) => return Err(TaskError::Http(format!("Thumbnail request failed: {err}"))),
    };
    if response.status() != 200 {
        return Err(TaskError::Http(format!(
            "Thumbnail request failed with status {}",
            response.status()
        )));
    }
    let mut reader = response.into_reader();
    let mut file = std::fs::File::create(target)?;
    io::copy(&mut reader, &mut file)?;
    Ok(())
}
