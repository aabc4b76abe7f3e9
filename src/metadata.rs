//! Video metadata lookup.
//!
//! The extraction tool is always asked, because only it knows which renditions
//! actually exist. An optional metadata API is asked first and wins on every
//! descriptive field it provides; the tool fills the gaps.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::PathBuf,
    process::Command,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::cookies::CookieFile;
use crate::error::{TaskError, TaskResult};
use crate::validate::extract_video_id;

const HD_MIN_HEIGHT: u32 = 720;
const QHD_MIN_HEIGHT: u32 = 1440;
const AUDIO_ONLY_LABEL: &str = "audio_only";
const DEFAULT_BEST_LABEL: &str = "Best quality (up to 2K)";
const UNKNOWN_TEXT: &str = "N/A";

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const API_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    /// Let the tool pick.
    Best,
    /// A video-only stream paired with the best audio-only stream.
    Merged,
    /// A native stream that already carries audio and video.
    Combined,
    Audio,
}

/// One selectable download option.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Rendition {
    pub format_id: String,
    pub resolution: String,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub filesize: Option<u64>,
    pub kind: FormatKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl Thumbnail {
    fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoSource {
    Extractor,
    ApiAndExtractor,
    ApiExtractorFailed,
}

#[derive(Clone, Debug, Serialize)]
pub struct VideoInfo {
    pub video_id: String,
    pub original_url: String,
    pub title: String,
    pub uploader: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub duration_seconds: Option<u64>,
    pub duration_iso: Option<String>,
    pub view_count: u64,
    pub like_count: u64,
    pub thumbnail_url: Option<String>,
    pub channel_logo_url: Option<String>,
    pub channel_subscriber_count: Option<u64>,
    pub formats: Vec<Rendition>,
    pub thumbnails: Vec<Thumbnail>,
    pub info_source: InfoSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extractor_error: Option<String>,
}

impl VideoInfo {
    /// Largest entry of the thumbnail list. The scalar `thumbnail_url` is
    /// display-only and never stands in for an empty list.
    pub fn best_thumbnail_url(&self) -> Option<&str> {
        self.thumbnails.first().map(|thumb| thumb.url.as_str())
    }
}

/// Descriptive fields returned by an authoritative metadata service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApiVideoMetadata {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub description: Option<String>,
    pub thumbnail_url: Option<String>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub duration_iso: Option<String>,
    pub channel_logo_url: Option<String>,
    pub channel_subscriber_count: Option<u64>,
}

/// Optional enrichment source. Implementations swallow their own failures and
/// return `None`.
pub trait MetadataApi: Send + Sync {
    fn fetch(&self, video_id: &str) -> Option<ApiVideoMetadata>;
}

pub struct NoMetadataApi;

impl MetadataApi for NoMetadataApi {
    fn fetch(&self, _video_id: &str) -> Option<ApiVideoMetadata> {
        None
    }
}

/// YouTube Data API v3 client.
pub struct YoutubeDataApi {
    api_key: String,
    base_url: String,
    agent: ureq::Agent,
}

impl YoutubeDataApi {
    pub fn new(api_key: impl Into<String>, proxy: Option<&str>) -> Self {
        let mut builder = ureq::AgentBuilder::new().timeout(API_TIMEOUT);
        if let Some(proxy) = proxy {
            match ureq::Proxy::new(proxy) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(err) => warn!(error = %err, "ignoring unusable proxy for metadata API"),
            }
        }
        Self {
            api_key: api_key.into(),
            base_url: YOUTUBE_API_BASE.to_string(),
            agent: builder.build(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn list<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        part: &str,
        id: &str,
    ) -> Result<ApiList<T>, ureq::Error> {
        let url = format!("{}/{resource}", self.base_url.trim_end_matches('/'));
        let list = self
            .agent
            .get(&url)
            .query("part", part)
            .query("id", id)
            .query("key", &self.api_key)
            .call()?
            .into_json()?;
        Ok(list)
    }
}

impl MetadataApi for YoutubeDataApi {
    fn fetch(&self, video_id: &str) -> Option<ApiVideoMetadata> {
        let videos: ApiList<ApiVideo> = match self.list(
            "videos",
            "snippet,statistics,contentDetails",
            video_id,
        ) {
            Ok(list) => list,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                if code == 403 && (body.contains("quotaExceeded") || body.contains("keyInvalid")) {
                    warn!(code, "metadata API quota exceeded or key invalid");
                } else {
                    warn!(code, body = %body, "metadata API request rejected");
                }
                return None;
            }
            Err(err) => {
                warn!(error = %err, "metadata API request failed");
                return None;
            }
        };

        let Some(video) = videos.items.into_iter().next() else {
            warn!(video_id, "metadata API returned no items");
            return None;
        };

        let channel = video.snippet.channel_id.as_deref().and_then(|channel_id| {
            match self.list::<ApiChannel>("channels", "snippet,statistics", channel_id) {
                Ok(list) => list.items.into_iter().next(),
                Err(err) => {
                    warn!(error = %err, channel_id, "channel lookup failed");
                    None
                }
            }
        });

        info!(video_id, "fetched metadata from API");
        Some(api_metadata_from(video, channel))
    }
}

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVideo {
    #[serde(default)]
    snippet: ApiSnippet,
    #[serde(default)]
    statistics: ApiStatistics,
    #[serde(default)]
    content_details: ApiContentDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiChannel {
    #[serde(default)]
    snippet: ApiSnippet,
    #[serde(default)]
    statistics: ApiStatistics,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSnippet {
    title: Option<String>,
    channel_title: Option<String>,
    channel_id: Option<String>,
    description: Option<String>,
    #[serde(default)]
    thumbnails: HashMap<String, ApiThumbnail>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiThumbnail {
    url: Option<String>,
}

// The API reports counters as decimal strings.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    subscriber_count: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiContentDetails {
    duration: Option<String>,
}

fn api_thumbnail(thumbnails: &HashMap<String, ApiThumbnail>, order: &[&str]) -> Option<String> {
    order
        .iter()
        .filter_map(|key| thumbnails.get(*key))
        .find_map(|thumb| thumb.url.clone())
}

fn parse_counter(value: Option<&String>) -> Option<u64> {
    value.and_then(|value| value.trim().parse().ok())
}

fn api_metadata_from(video: ApiVideo, channel: Option<ApiChannel>) -> ApiVideoMetadata {
    let thumbnail_url = api_thumbnail(
        &video.snippet.thumbnails,
        &["high", "medium", "default", "standard", "maxres"],
    );
    let (channel_logo_url, channel_subscriber_count) = match &channel {
        Some(channel) => (
            api_thumbnail(&channel.snippet.thumbnails, &["default"]),
            parse_counter(channel.statistics.subscriber_count.as_ref()),
        ),
        None => (None, None),
    };

    ApiVideoMetadata {
        title: video.snippet.title,
        uploader: video.snippet.channel_title,
        description: video.snippet.description,
        thumbnail_url,
        view_count: parse_counter(video.statistics.view_count.as_ref()),
        like_count: parse_counter(video.statistics.like_count.as_ref()),
        duration_iso: video.content_details.duration,
        channel_logo_url,
        channel_subscriber_count,
    }
}

/// Subset of the extraction tool's `--dump-single-json` payload. Everything is
/// optional because older videos may lack fields.
#[derive(Debug, Default, Deserialize)]
pub struct ExtractorInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub description: Option<String>,
    pub duration: Option<f64>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub thumbnail: Option<String>,
    pub channel_thumbnail_url: Option<String>,
    pub channel_follower_count: Option<u64>,
    #[serde(default)]
    pub formats: Vec<ExtractorFormat>,
    #[serde(default)]
    pub thumbnails: Vec<ExtractorThumbnail>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExtractorFormat {
    pub format_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub tbr: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
}

impl ExtractorFormat {
    // A missing codec field counts as present; only an explicit "none" rules
    // the stream out.
    fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    fn bitrate(&self) -> f64 {
        self.tbr.unwrap_or(0.0)
    }

    fn size(&self) -> u64 {
        self.filesize.or(self.filesize_approx).unwrap_or(0)
    }

    fn resolution(&self, height: u32) -> String {
        format!("{}x{height}", self.width.unwrap_or(0))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExtractorThumbnail {
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Turns the tool's raw format list into the options offered to users.
///
/// The result starts with the synthetic "best" entry, lists HD renditions by
/// descending height, and ends with the audio-only entry when one exists.
pub fn build_renditions(formats: &[ExtractorFormat]) -> Vec<Rendition> {
    let mut best_video: BTreeMap<u32, &ExtractorFormat> = BTreeMap::new();
    let mut best_audio: Option<&ExtractorFormat> = None;

    for format in formats {
        match (format.has_video(), format.has_audio()) {
            (true, false) => {
                let Some(height) = format.height.filter(|height| *height >= HD_MIN_HEIGHT) else {
                    continue;
                };
                let replace = best_video
                    .get(&height)
                    .is_none_or(|current| format.bitrate() > current.bitrate());
                if replace {
                    best_video.insert(height, format);
                }
            }
            (false, true) => {
                if best_audio.is_none_or(|current| format.bitrate() > current.bitrate()) {
                    best_audio = Some(format);
                }
            }
            _ => {}
        }
    }

    let mut entries: Vec<Rendition> = Vec::new();
    let audio_id = best_audio
        .and_then(|audio| audio.format_id.clone())
        .unwrap_or_else(|| "bestaudio".to_string());
    let audio_size = best_audio.map(ExtractorFormat::size).unwrap_or(0);

    for (height, video) in &best_video {
        let video_id = video.format_id.as_deref().unwrap_or("bestvideo");
        let total = video.size() + audio_size;
        entries.push(Rendition {
            format_id: format!("{video_id}+{audio_id}"),
            resolution: video.resolution(*height),
            height: Some(*height),
            fps: video.fps,
            filesize: (total > 0).then_some(total),
            kind: FormatKind::Merged,
        });
    }

    for format in formats.iter().filter(|f| f.has_video() && f.has_audio()) {
        let Some(height) = format.height.filter(|height| *height >= HD_MIN_HEIGHT) else {
            continue;
        };
        let Some(format_id) = format.format_id.clone() else {
            continue;
        };
        let resolution = format.resolution(height);
        if entries.iter().any(|entry| entry.resolution == resolution) {
            continue;
        }
        entries.push(Rendition {
            format_id,
            resolution,
            height: Some(height),
            fps: format.fps,
            filesize: format.filesize.or(format.filesize_approx),
            kind: FormatKind::Combined,
        });
    }

    entries.sort_by(|a, b| b.height.cmp(&a.height));

    let max_height = entries.iter().filter_map(|entry| entry.height).max();
    let best_label = match max_height {
        Some(height) if height >= QHD_MIN_HEIGHT => DEFAULT_BEST_LABEL.to_string(),
        Some(height) => format!("Best quality (up to {height}p)"),
        None => DEFAULT_BEST_LABEL.to_string(),
    };

    let mut renditions = Vec::with_capacity(entries.len() + 2);
    renditions.push(Rendition {
        format_id: "best".to_string(),
        resolution: best_label,
        height: None,
        fps: None,
        filesize: None,
        kind: FormatKind::Best,
    });
    renditions.extend(entries);

    if let Some(audio) = best_audio
        && let Some(format_id) = audio.format_id.clone()
    {
        renditions.push(Rendition {
            format_id,
            resolution: AUDIO_ONLY_LABEL.to_string(),
            height: None,
            fps: None,
            filesize: audio.filesize.or(audio.filesize_approx),
            kind: FormatKind::Audio,
        });
    }

    renditions
}

/// Thumbnails with a URL, largest first.
pub fn build_thumbnails(thumbnails: &[ExtractorThumbnail]) -> Vec<Thumbnail> {
    let mut list: Vec<Thumbnail> = thumbnails
        .iter()
        .filter_map(|thumb| {
            Some(Thumbnail {
                url: thumb.url.clone()?,
                width: thumb.width.unwrap_or(0),
                height: thumb.height.unwrap_or(0),
            })
        })
        .collect();
    list.sort_by_key(|thumb| std::cmp::Reverse(thumb.area()));
    list
}

pub struct MetadataFetcher {
    ytdlp: PathBuf,
    proxy: Option<String>,
    cookies_content: Option<String>,
    api: Arc<dyn MetadataApi>,
}

impl MetadataFetcher {
    pub fn new(ytdlp: impl Into<PathBuf>) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            proxy: None,
            cookies_content: None,
            api: Arc::new(NoMetadataApi),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let api: Arc<dyn MetadataApi> = match &settings.youtube_api_key {
            Some(key) => Arc::new(YoutubeDataApi::new(key, settings.proxy_url.as_deref())),
            None => Arc::new(NoMetadataApi),
        };
        Self::new(&settings.tools.ytdlp)
            .with_proxy(settings.proxy_url.clone())
            .with_cookies_content(settings.cookies_content.clone())
            .with_api(api)
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_cookies_content(mut self, content: Option<String>) -> Self {
        self.cookies_content = content;
        self
    }

    pub fn with_api(mut self, api: Arc<dyn MetadataApi>) -> Self {
        self.api = api;
        self
    }

    /// Blocking; callers on the async runtime go through `spawn_blocking`.
    pub fn get_video_info(&self, url: &str) -> TaskResult<VideoInfo> {
        let video_id =
            extract_video_id(url).ok_or_else(|| TaskError::invalid_input("Invalid YouTube URL"))?;

        let api = self.api.fetch(&video_id);
        let extracted = self.run_extractor(url);

        let (info, source, extractor_error) = match (api.is_some(), extracted) {
            (_, Ok(info)) => {
                let source = if api.is_some() {
                    InfoSource::ApiAndExtractor
                } else {
                    InfoSource::Extractor
                };
                (info, source, None)
            }
            (true, Err(message)) => {
                warn!(url, error = %message, "extractor failed; returning API metadata only");
                (ExtractorInfo::default(), InfoSource::ApiExtractorFailed, Some(message))
            }
            (false, Err(message)) => return Err(TaskError::InfoUnavailable(message)),
        };

        let api = api.unwrap_or_default();
        let duration_seconds = info.duration.map(|secs| secs.max(0.0).round() as u64);
        let duration_iso = api
            .duration_iso
            .or_else(|| duration_seconds.map(|secs| format!("PT{secs}S")));

        let video = VideoInfo {
            video_id,
            original_url: url.to_string(),
            title: api
                .title
                .or(info.title)
                .unwrap_or_else(|| UNKNOWN_TEXT.to_string()),
            uploader: api
                .uploader
                .or(info.uploader)
                .unwrap_or_else(|| UNKNOWN_TEXT.to_string()),
            description: api.description.or(info.description),
            duration_seconds,
            duration_iso,
            view_count: api.view_count.or(info.view_count).unwrap_or(0),
            like_count: api.like_count.or(info.like_count).unwrap_or(0),
            thumbnail_url: api.thumbnail_url.or(info.thumbnail),
            channel_logo_url: api.channel_logo_url.or(info.channel_thumbnail_url),
            channel_subscriber_count: api
                .channel_subscriber_count
                .or(info.channel_follower_count),
            formats: build_renditions(&info.formats),
            thumbnails: build_thumbnails(&info.thumbnails),
            info_source: source,
            extractor_error,
        };
        debug!(
            url,
            source = ?video.info_source,
            formats = video.formats.len(),
            "resolved video info"
        );
        Ok(video)
    }

    fn run_extractor(&self, url: &str) -> Result<ExtractorInfo, String> {
        let cookie_file = match self.cookie_file() {
            Ok(file) => file,
            Err(err) => {
                warn!(error = %err, "could not write cookie file; continuing without cookies");
                None
            }
        };

        let mut command = Command::new(&self.ytdlp);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-playlist");
        if let Some(proxy) = &self.proxy {
            command.arg("--proxy").arg(proxy);
        }
        if let Some(cookies) = &cookie_file {
            command.arg("--cookies").arg(cookies.path());
        }
        command.arg(url);

        let output = command.output().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                format!("{} not found", self.ytdlp.display())
            } else {
                format!("launching {}: {err}", self.ytdlp.display())
            }
        })?;
        drop(cookie_file);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("no error output");
            return Err(format!("extractor exited with {}: {reason}", output.status));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| format!("parsing extractor output: {err}"))
    }

    fn cookie_file(&self) -> io::Result<Option<CookieFile>> {
        self.cookies_content
            .as_deref()
            .map(CookieFile::write)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{install_failing_ytdlp, install_stub};
    use anyhow::Result;
    use tempfile::tempdir;

    fn video(id: &str, width: u32, height: u32, tbr: f64, size: u64) -> ExtractorFormat {
        ExtractorFormat {
            format_id: Some(id.into()),
            width: Some(width),
            height: Some(height),
            fps: Some(30.0),
            vcodec: Some("vp9".into()),
            acodec: Some("none".into()),
            tbr: Some(tbr),
            filesize: Some(size),
            filesize_approx: None,
        }
    }

    fn audio(id: &str, tbr: f64, size: u64) -> ExtractorFormat {
        ExtractorFormat {
            format_id: Some(id.into()),
            vcodec: Some("none".into()),
            acodec: Some("opus".into()),
            tbr: Some(tbr),
            filesize: Some(size),
            ..ExtractorFormat::default()
        }
    }

    fn combined(id: &str, width: u32, height: u32) -> ExtractorFormat {
        ExtractorFormat {
            format_id: Some(id.into()),
            width: Some(width),
            height: Some(height),
            vcodec: Some("avc1".into()),
            acodec: Some("mp4a".into()),
            ..ExtractorFormat::default()
        }
    }

    struct FakeApi(Option<ApiVideoMetadata>);

    impl MetadataApi for FakeApi {
        fn fetch(&self, _video_id: &str) -> Option<ApiVideoMetadata> {
            self.0.clone()
        }
    }

    const SAMPLE_JSON: &str = r#"{
  "id": "ABCDEFGHIJK",
  "title": "Extractor Title",
  "uploader": "Extractor Channel",
  "duration": 212,
  "view_count": 10,
  "like_count": 2,
  "thumbnail": "https://i.ytimg.com/vi/ABCDEFGHIJK/hq.jpg",
  "channel_follower_count": 100,
  "formats": [
    {"format_id": "140", "vcodec": "none", "acodec": "mp4a", "tbr": 130, "filesize": 100},
    {"format_id": "137", "width": 1920, "height": 1080, "vcodec": "avc1", "acodec": "none", "tbr": 1379, "filesize": 1000},
    {"format_id": "18", "width": 640, "height": 360, "vcodec": "avc1", "acodec": "mp4a"}
  ],
  "thumbnails": [
    {"url": "https://i.ytimg.com/small.jpg", "width": 120, "height": 90},
    {"url": "https://i.ytimg.com/max.jpg", "width": 1280, "height": 720},
    {"url": "https://i.ytimg.com/nosize.jpg"}
  ]
}"#;

    fn install_json_ytdlp(dir: &std::path::Path) -> Result<PathBuf> {
        install_stub(dir, "yt-dlp", &format!("cat <<'JSON'\n{SAMPLE_JSON}\nJSON"))
    }

    #[test]
    fn renditions_pick_highest_bitrate_and_order() {
        let formats = vec![
            video("136", 1280, 720, 500.0, 10),
            video("247", 1280, 720, 390.0, 8),
            video("137", 1920, 1080, 1379.0, 30),
            video("160", 256, 144, 59.0, 1),
            audio("139", 49.0, 1),
            audio("251", 140.0, 3),
            combined("22", 1280, 720),
            combined("95", 2560, 1440),
        ];
        let renditions = build_renditions(&formats);

        let ids: Vec<&str> = renditions.iter().map(|r| r.format_id.as_str()).collect();
        assert_eq!(ids, vec!["best", "95", "137+251", "136+251", "251"]);
        assert_eq!(renditions[0].kind, FormatKind::Best);
        assert_eq!(renditions[0].resolution, "Best quality (up to 2K)");
        assert_eq!(renditions[1].kind, FormatKind::Combined);
        assert_eq!(renditions[2].filesize, Some(33));
        assert_eq!(renditions[2].resolution, "1920x1080");
        assert_eq!(renditions[4].kind, FormatKind::Audio);
        assert_eq!(renditions[4].resolution, "audio_only");
    }

    #[test]
    fn best_label_names_top_height_below_2k() {
        let renditions = build_renditions(&[video("137", 1920, 1080, 1.0, 1), audio("140", 1.0, 1)]);
        assert_eq!(renditions[0].resolution, "Best quality (up to 1080p)");
    }

    #[test]
    fn no_formats_still_offers_best() {
        let renditions = build_renditions(&[]);
        assert_eq!(renditions.len(), 1);
        assert_eq!(renditions[0].format_id, "best");
    }

    #[test]
    fn thumbnails_sorted_by_area() {
        let thumbs = build_thumbnails(&[
            ExtractorThumbnail {
                url: Some("small".into()),
                width: Some(120),
                height: Some(90),
            },
            ExtractorThumbnail {
                url: None,
                width: Some(4000),
                height: Some(4000),
            },
            ExtractorThumbnail {
                url: Some("big".into()),
                width: Some(1280),
                height: Some(720),
            },
        ]);
        let urls: Vec<&str> = thumbs.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(urls, vec!["big", "small"]);
    }

    #[test]
    fn api_response_mapping() {
        let video: ApiVideo = serde_json::from_str(
            r#"{
              "snippet": {
                "title": "API Title",
                "channelTitle": "API Channel",
                "channelId": "UC123",
                "thumbnails": {
                  "default": {"url": "https://img/default.jpg"},
                  "high": {"url": "https://img/high.jpg"}
                }
              },
              "statistics": {"viewCount": "1234", "likeCount": "56"},
              "contentDetails": {"duration": "PT3M32S"}
            }"#,
        )
        .unwrap();
        let channel: ApiChannel = serde_json::from_str(
            r#"{
              "snippet": {"thumbnails": {"default": {"url": "https://img/logo.jpg"}}},
              "statistics": {"subscriberCount": "789"}
            }"#,
        )
        .unwrap();

        let meta = api_metadata_from(video, Some(channel));
        assert_eq!(meta.title.as_deref(), Some("API Title"));
        assert_eq!(meta.uploader.as_deref(), Some("API Channel"));
        assert_eq!(meta.thumbnail_url.as_deref(), Some("https://img/high.jpg"));
        assert_eq!(meta.view_count, Some(1234));
        assert_eq!(meta.like_count, Some(56));
        assert_eq!(meta.duration_iso.as_deref(), Some("PT3M32S"));
        assert_eq!(meta.channel_logo_url.as_deref(), Some("https://img/logo.jpg"));
        assert_eq!(meta.channel_subscriber_count, Some(789));
    }

    #[test]
    fn extractor_only_info() -> Result<()> {
        let dir = tempdir()?;
        let fetcher = MetadataFetcher::new(install_json_ytdlp(dir.path())?);
        let info = fetcher.get_video_info("https://youtu.be/ABCDEFGHIJK")?;

        assert_eq!(info.video_id, "ABCDEFGHIJK");
        assert_eq!(info.title, "Extractor Title");
        assert_eq!(info.duration_seconds, Some(212));
        assert_eq!(info.duration_iso.as_deref(), Some("PT212S"));
        assert_eq!(info.channel_subscriber_count, Some(100));
        assert_eq!(info.info_source, InfoSource::Extractor);
        assert_eq!(info.formats[0].resolution, "Best quality (up to 1080p)");
        assert_eq!(info.formats[1].format_id, "137+140");
        assert_eq!(info.thumbnails[0].url, "https://i.ytimg.com/max.jpg");
        assert_eq!(info.best_thumbnail_url(), Some("https://i.ytimg.com/max.jpg"));
        Ok(())
    }

    #[test]
    fn api_fields_take_precedence() -> Result<()> {
        let dir = tempdir()?;
        let api = ApiVideoMetadata {
            title: Some("API Title".into()),
            view_count: Some(999),
            duration_iso: Some("PT3M32S".into()),
            ..ApiVideoMetadata::default()
        };
        let fetcher = MetadataFetcher::new(install_json_ytdlp(dir.path())?)
            .with_api(Arc::new(FakeApi(Some(api))));
        let info = fetcher.get_video_info("https://www.youtube.com/watch?v=ABCDEFGHIJK")?;

        assert_eq!(info.title, "API Title");
        assert_eq!(info.uploader, "Extractor Channel");
        assert_eq!(info.view_count, 999);
        assert_eq!(info.like_count, 2);
        assert_eq!(info.duration_iso.as_deref(), Some("PT3M32S"));
        assert_eq!(info.info_source, InfoSource::ApiAndExtractor);
        Ok(())
    }

    #[test]
    fn api_survives_extractor_failure() -> Result<()> {
        let dir = tempdir()?;
        let api = ApiVideoMetadata {
            title: Some("API Title".into()),
            ..ApiVideoMetadata::default()
        };
        let fetcher = MetadataFetcher::new(install_failing_ytdlp(dir.path())?)
            .with_api(Arc::new(FakeApi(Some(api))));
        let info = fetcher.get_video_info("https://youtu.be/ABCDEFGHIJK")?;

        assert_eq!(info.title, "API Title");
        assert_eq!(info.info_source, InfoSource::ApiExtractorFailed);
        assert!(
            info.extractor_error
                .as_deref()
                .is_some_and(|err| err.contains("Video unavailable"))
        );
        assert_eq!(info.formats.len(), 1);
        assert!(info.thumbnails.is_empty());
        Ok(())
    }

    #[test]
    fn both_sources_failing_is_info_unavailable() -> Result<()> {
        let dir = tempdir()?;
        let fetcher = MetadataFetcher::new(install_failing_ytdlp(dir.path())?);
        let err = fetcher
            .get_video_info("https://youtu.be/ABCDEFGHIJK")
            .unwrap_err();
        assert!(matches!(err, TaskError::InfoUnavailable(_)));
        assert!(err.to_string().contains("Video unavailable"));
        Ok(())
    }

    #[test]
    fn missing_tool_is_info_unavailable() {
        let fetcher = MetadataFetcher::new("/nonexistent/yt-dlp");
        let err = fetcher
            .get_video_info("https://youtu.be/ABCDEFGHIJK")
            .unwrap_err();
        assert!(matches!(err, TaskError::InfoUnavailable(_)));
    }

    #[test]
    fn invalid_url_is_rejected_before_any_lookup() {
        let fetcher = MetadataFetcher::new("/nonexistent/yt-dlp");
        let err = fetcher.get_video_info("https://vimeo.com/123").unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
    }

    #[test]
    fn cookie_content_is_passed_as_file() -> Result<()> {
        let dir = tempdir()?;
        let seen = dir.path().join("seen-cookies");
        let body = format!(
            r#"
args=("$@")
for ((i = 0; i < ${{#args[@]}}; i++)); do
  if [[ "${{args[$i]}}" == "--cookies" ]]; then
    cat "${{args[$((i + 1))]}}" > "{seen}"
  fi
done
echo '{{"title": "t"}}'
"#,
            seen = seen.display()
        );
        let ytdlp = install_stub(dir.path(), "yt-dlp", &body)?;
        let fetcher = MetadataFetcher::new(ytdlp)
            .with_cookies_content(Some("# Netscape HTTP Cookie File\n".into()));
        fetcher.get_video_info("https://youtu.be/ABCDEFGHIJK")?;
        assert_eq!(std::fs::read_to_string(seen)?, "# Netscape HTTP Cookie File\n");
        Ok(())
    }

    async fn serve_api(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/youtube/v3")
    }

    async fn fetch_from(base: String, video_id: &'static str) -> Option<ApiVideoMetadata> {
        tokio::task::spawn_blocking(move || {
            YoutubeDataApi::new("test-key", None)
                .with_base_url(base)
                .fetch(video_id)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn data_api_fetches_video_and_channel() {
        use axum::{extract::Query, routing::get};

        let app = axum::Router::new()
            .route(
                "/youtube/v3/videos",
                get(|Query(query): Query<HashMap<String, String>>| async move {
                    assert_eq!(query["key"], "test-key");
                    if query["id"] != "ABCDEFGHIJK" {
                        return r#"{"items": []}"#.to_string();
                    }
                    r#"{"items": [{
                      "snippet": {"title": "API Title", "channelTitle": "Chan", "channelId": "UC1",
                                  "thumbnails": {"high": {"url": "https://img/high.jpg"}}},
                      "statistics": {"viewCount": "10", "likeCount": "2"},
                      "contentDetails": {"duration": "PT1M"}
                    }]}"#
                        .to_string()
                }),
            )
            .route(
                "/youtube/v3/channels",
                get(|Query(query): Query<HashMap<String, String>>| async move {
                    assert_eq!(query["id"], "UC1");
                    r#"{"items": [{"snippet": {"thumbnails": {"default": {"url": "https://img/logo.jpg"}}},
                                   "statistics": {"subscriberCount": "5"}}]}"#
                }),
            );
        let base = serve_api(app).await;

        let meta = fetch_from(base.clone(), "ABCDEFGHIJK").await.unwrap();
        assert_eq!(meta.title.as_deref(), Some("API Title"));
        assert_eq!(meta.uploader.as_deref(), Some("Chan"));
        assert_eq!(meta.view_count, Some(10));
        assert_eq!(meta.duration_iso.as_deref(), Some("PT1M"));
        assert_eq!(meta.channel_logo_url.as_deref(), Some("https://img/logo.jpg"));
        assert_eq!(meta.channel_subscriber_count, Some(5));

        assert_eq!(fetch_from(base, "ZZZZZZZZZZZ").await, None);
    }

    #[tokio::test]
    async fn data_api_quota_rejection_yields_nothing() {
        use axum::{http::StatusCode, routing::get};

        let app = axum::Router::new().route(
            "/youtube/v3/videos",
            get(|| async {
                (
                    StatusCode::FORBIDDEN,
                    r#"{"error": {"errors": [{"reason": "quotaExceeded"}]}}"#,
                )
            }),
        );
        let base = serve_api(app).await;

        assert_eq!(fetch_from(base, "ABCDEFGHIJK").await, None);
    }
}
