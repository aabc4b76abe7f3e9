#![forbid(unsafe_code)]

//! Axum backend in front of the download task engine.
//!
//! Handlers stay thin: validation and state live in the library, the routes
//! only translate between JSON and the registry/runner calls. Finished files
//! are streamed once and their task directory is deleted shortly after.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tubegrab::{
    config::{Settings, SettingsOverrides, load_settings},
    error::TaskError,
    metadata::{MetadataFetcher, VideoInfo},
    registry::TaskRegistry,
    runner::DownloadRunner,
    sweeper::{RetentionSweeper, remove_task_dir},
    task::ProgressView,
};

const NOT_READY: &str = "File not found or download not complete";

#[derive(Debug, Parser)]
#[command(name = "backend", about = "YouTube download service")]
struct BackendArgs {
    /// Root of per-task working directories and the registry snapshot.
    #[arg(long)]
    storage_root: Option<PathBuf>,
    /// Directory with the static front end.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// Alternative to `./.env`.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            storage_root: self.storage_root,
            www_root: self.www_root,
            port: self.port,
            host: self.host,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    runner: DownloadRunner,
    registry: TaskRegistry,
    fetcher: Arc<MetadataFetcher>,
    www_root: Arc<PathBuf>,
    artifact_grace: Duration,
}

impl AppState {
    fn new(runner: DownloadRunner, settings: &Settings) -> Self {
        Self {
            registry: runner.registry().clone(),
            fetcher: runner.fetcher(),
            runner,
            www_root: Arc::new(settings.www_root.clone()),
            artifact_grace: settings.artifact_grace,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        let status = match &err {
            TaskError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::InfoUnavailable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct VideoInfoRequest {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadStarted {
    download_id: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    success: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let settings = load_settings(BackendArgs::parse().into_overrides())?;

    std::fs::create_dir_all(&settings.storage_root)
        .with_context(|| format!("creating {}", settings.storage_root.display()))?;
    let registry = TaskRegistry::load(&settings.storage_root);
    let runner = DownloadRunner::from_settings(registry.clone(), &settings);
    let state = AppState::new(runner, &settings);

    if settings.cookies_content.is_some() {
        info!("using configured cookie content");
    } else if settings.browser_cookies_enabled() {
        info!(chromedriver = %settings.chromedriver.display(), "browser cookie harvesting enabled");
    }

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(RetentionSweeper::new(registry.clone(), &settings).run(shutdown.clone()));

    let host = parse_host(&settings.host)?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, storage_root = %settings.storage_root.display(), "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "sweeper task ended abnormally");
    }
    registry.persist().context("persisting task registry")?;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let default_level = match std::env::var("DEBUG") {
        Ok(value) if !value.trim().is_empty() => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_host(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .with_context(|| format!("expected a valid IPv4 or IPv6 address for HOST, got {value:?}"))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/video-info", post(video_info))
        .route("/api/download", post(start_download))
        .route("/api/progress/{id}", get(download_progress))
        .route("/api/download-file/{id}", get(download_file))
        .route("/api/cancel/{id}", post(cancel_download))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> ApiResult<Json<VideoInfo>> {
    let url = required(payload.url).ok_or_else(|| ApiError::bad_request("URL is required"))?;
    let fetcher = Arc::clone(&state.fetcher);
    let info = tokio::task::spawn_blocking(move || fetcher.get_video_info(&url))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))??;
    Ok(Json(info))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadStarted>> {
    let (Some(url), Some(format)) = (required(payload.url), required(payload.format)) else {
        return Err(ApiError::bad_request("URL and format type are required"));
    };
    let download_id = state
        .runner
        .start(&url, &format, payload.quality.as_deref())?;
    Ok(Json(DownloadStarted { download_id }))
}

async fn download_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<ProgressView>> {
    Ok(Json(state.registry.read(&id)?))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let artifact = match state.registry.artifact(&id) {
        Ok(Some(artifact)) => artifact,
        Ok(None) | Err(TaskError::NotFound(_)) => return Err(ApiError::not_found(NOT_READY)),
        Err(err) => return Err(err.into()),
    };

    let mime = artifact.mime_type.parse::<Mime>().ok();
    let mut response = send_file(&artifact.path, mime, Some(&headers))
        .await
        .map_err(|_| ApiError::not_found(NOT_READY))?;
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&artifact.filename)) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }

    if let Some(record) = state.registry.record(&id) {
        schedule_cleanup(id, record.work_dir, state.artifact_grace);
    }
    Ok(response)
}

async fn cancel_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Json<CancelResponse> {
    let success = state.registry.cancel(&id);
    Json(CancelResponse { success })
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn required(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Deletes a served task directory once the response had time to finish.
fn schedule_cleanup(task_id: String, work_dir: PathBuf, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        match tokio::task::spawn_blocking(move || remove_task_dir(&work_dir)).await {
            Ok(Ok(())) => info!(task_id = %task_id, "removed served task directory"),
            Ok(Err(err)) => warn!(task_id = %task_id, error = %err, "could not remove task directory"),
            Err(err) => warn!(task_id = %task_id, error = %err, "cleanup task panicked"),
        }
    });
}

/// `attachment` header with an ASCII fallback name plus the exact UTF-8 name.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(filename.len());
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

/// Where a front-end request lands inside the www root.
#[derive(Debug, PartialEq, Eq)]
enum WwwTarget {
    File(PathBuf),
    // Unknown extension-less paths are client-side routes of the front end.
    Index,
    Missing,
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let file = match locate_www_target(root, request_path).await? {
        WwwTarget::File(path) => path,
        WwwTarget::Index => root.join("index.html"),
        WwwTarget::Missing => return Err(ApiError::not_found("file not found")),
    };
    send_file(&file, None, None).await
}

async fn locate_www_target(root: &Path, request_path: &str) -> ApiResult<WwwTarget> {
    let Some(relative) = www_relative_path(request_path)? else {
        return Ok(WwwTarget::Index);
    };
    let target = match tokio::fs::metadata(root.join(&relative)).await {
        Ok(meta) if meta.is_dir() => WwwTarget::Index,
        Ok(_) => WwwTarget::File(root.join(relative)),
        Err(_) if relative.extension().is_none() => WwwTarget::Index,
        Err(_) => WwwTarget::Missing,
    };
    Ok(target)
}

/// Request path relative to the www root, `None` for the root itself. Only
/// plain name components are accepted.
fn www_relative_path(request_path: &str) -> ApiResult<Option<PathBuf>> {
    let relative = PathBuf::from(request_path.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    if relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        Ok(Some(relative))
    } else {
        Err(ApiError::not_found("file not found"))
    }
}

/// Byte span requested by a `Range` header, resolved against the file size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ByteRange {
    Whole,
    Span { first: u64, last: u64 },
    Unsatisfiable,
}

impl ByteRange {
    fn from_headers(headers: Option<&HeaderMap>, size: u64) -> Self {
        headers
            .and_then(|headers| headers.get(header::RANGE))
            .and_then(|value| value.to_str().ok())
            .map_or(Self::Whole, |value| Self::parse(value, size))
    }

    /// Single `bytes=` ranges only. Anything unparseable falls back to the
    /// whole file.
    fn parse(value: &str, size: u64) -> Self {
        let Some(spec) = value.trim().strip_prefix("bytes=") else {
            return Self::Whole;
        };
        let Some((first, last)) = spec.trim().split_once('-') else {
            return Self::Whole;
        };
        let last_byte = size.saturating_sub(1);

        let (first, last) = match (first.parse::<u64>(), last.parse::<u64>()) {
            // "-N" asks for the final N bytes.
            (Err(_), Ok(suffix)) if first.is_empty() && suffix > 0 => {
                (size.saturating_sub(suffix), last_byte)
            }
            (Ok(first), Err(_)) if last.is_empty() => (first, last_byte),
            (Ok(first), Ok(last)) if last >= first => (first, last.min(last_byte)),
            _ => return Self::Whole,
        };
        if first >= size {
            Self::Unsatisfiable
        } else {
            Self::Span { first, last }
        }
    }
}

async fn send_file(
    path: &Path,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let missing = |_| ApiError::not_found("file not found");
    let mut file = File::open(path).await.map_err(missing)?;
    let size = file.metadata().await.map_err(missing)?.len();
    let range = ByteRange::from_headers(headers, size);

    let mut response = match range {
        ByteRange::Whole => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            insert_header(&mut response, header::CONTENT_LENGTH, size.to_string());
            response
        }
        ByteRange::Span { first, last } => {
            let length = last - first + 1;
            file.seek(std::io::SeekFrom::Start(first))
                .await
                .map_err(missing)?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = (StatusCode::PARTIAL_CONTENT, body).into_response();
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes {first}-{last}/{size}"),
            );
            insert_header(&mut response, header::CONTENT_LENGTH, length.to_string());
            response
        }
        ByteRange::Unsatisfiable => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            insert_header(&mut response, header::CONTENT_RANGE, format!("bytes */{size}"));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = mime.or_else(|| MimeGuess::from_path(path).first()) {
        insert_header(&mut response, header::CONTENT_TYPE, mime.to_string());
    }
    debug!(path = %path.display(), size, ?range, "sending file");
    Ok(response)
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}
