#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_STORAGE_ROOT: &str = "./downloads";
pub const DEFAULT_WWW_ROOT: &str = "./static";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_CHROMEDRIVER: &str = "chromedriver";
pub const DEFAULT_TASK_MAX_AGE_SECS: u64 = 3600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_ARTIFACT_GRACE_SECS: u64 = 5;

/// Everything the service reads from its environment, resolved once at
/// startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub storage_root: PathBuf,
    pub www_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub tools: ToolPaths,
    pub proxy_url: Option<String>,
    pub cookies_content: Option<String>,
    pub disable_browser: bool,
    pub chromedriver: PathBuf,
    pub chrome_binary: Option<PathBuf>,
    pub youtube_api_key: Option<String>,
    pub task_max_age: Duration,
    pub sweep_interval: Duration,
    pub artifact_grace: Duration,
}

/// External executables. `ffmpeg_location` is what gets forwarded to yt-dlp
/// when the operator pointed us at a specific ffmpeg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ytdlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffmpeg_location: Option<PathBuf>,
}

impl ToolPaths {
    pub fn new(ytdlp: impl Into<PathBuf>, ffmpeg_override: Option<PathBuf>) -> Self {
        let (ffmpeg, ffmpeg_location) = match ffmpeg_override {
            Some(path) if path.is_dir() => (path.join(DEFAULT_FFMPEG), Some(path)),
            Some(path) => (path.clone(), Some(path)),
            None => (PathBuf::from(DEFAULT_FFMPEG), None),
        };
        Self {
            ytdlp: ytdlp.into(),
            ffmpeg,
            ffmpeg_location,
        }
    }
}

impl Settings {
    /// Built-in defaults with the given storage root; nothing is read from
    /// the environment.
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        let mut settings = build_settings(&HashMap::new(), |_| None, SettingsOverrides::default());
        settings.storage_root = storage_root.into();
        settings
    }

    /// Browser cookie harvesting is only attempted when no literal cookie
    /// content was supplied and the operator did not turn it off.
    pub fn browser_cookies_enabled(&self) -> bool {
        self.cookies_content.is_none() && !self.disable_browser
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub storage_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_settings(&file_vars, env_var_string, overrides))
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let seconds = |key: &str, default: u64| {
        Duration::from_secs(
            lookup(key)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default),
        )
    };

    let storage_root = overrides
        .storage_root
        .or_else(|| lookup("STORAGE_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
    let www_root = overrides
        .www_root
        .or_else(|| lookup("WWW_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let port = overrides
        .port
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let tools = ToolPaths::new(
        lookup("YTDLP_PATH").unwrap_or_else(|| DEFAULT_YTDLP.to_string()),
        lookup("FFMPEG_PATH").map(PathBuf::from),
    );

    Settings {
        storage_root,
        www_root,
        port,
        host,
        tools,
        proxy_url: lookup("YTDLP_PROXY_URL"),
        cookies_content: lookup("YTDLP_COOKIES_CONTENT"),
        disable_browser: lookup("DISABLE_BROWSER").is_some_and(|value| is_truthy(&value)),
        chromedriver: lookup("CHROMEDRIVER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CHROMEDRIVER)),
        chrome_binary: lookup("CHROME_BINARY").map(PathBuf::from),
        youtube_api_key: lookup("YOUTUBE_API_KEY"),
        task_max_age: seconds("TASK_MAX_AGE_SECS", DEFAULT_TASK_MAX_AGE_SECS),
        sweep_interval: seconds("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
        artifact_grace: seconds("ARTIFACT_GRACE_SECS", DEFAULT_ARTIFACT_GRACE_SECS),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Reads `KEY=value` pairs from a dotenv file. A missing file is empty.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().filter_map(parse_env_line).collect()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(err).with_context(|| format!("Reading {}", path.display())),
    }
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let assignment = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = assignment.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then(|| (key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| value.strip_prefix(*quote)?.strip_suffix(*quote))
        .unwrap_or(value)
}
