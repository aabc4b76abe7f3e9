//! Incremental parser for yt-dlp `--newline` output.
//!
//! Each call folds one line into the previously known [`ProgressFacts`]. Only
//! the facts a line actually carries are replaced; everything else is carried
//! over, so a bare percentage line never blanks a known speed or ETA.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CALCULATING: &str = "Calculating...";

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("static regex"));
static SIZE_PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*([KMG]iB)\s+of\s+~?\s*(\d+(?:\.\d+)?)\s*([KMG]iB)")
        .expect("static regex")
});
static TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bof\s+~?\s*(\d+(?:\.\d+)?)\s*([KMG]iB)").expect("static regex")
});
static RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bat\s+(\d+(?:\.\d+)?)\s*([KMG]iB|B)/s").expect("static regex")
});
static ETA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bETA\s+(\S+)").expect("static regex"));
static MERGE_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"Merging formats into "(.+)""#).expect("static regex"));

const DESTINATION_MARKER: &str = "Destination:";
const MERGE_MARKERS: &[&str] = &["[Merger]"];
const CONVERT_MARKERS: &[&str] = &["[VideoConvertor]", "[ExtractAudio]", "[VideoRemuxer]"];

/// Post-download stage announced by the extraction tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Merging,
    Converting,
}

impl ProcessingStage {
    /// Text shown in place of an ETA while the stage runs.
    pub fn label(self) -> &'static str {
        match self {
            Self::Merging => "Merging streams...",
            Self::Converting => "Converting...",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressFacts {
    pub percent: f64,
    pub downloaded_bytes: Option<f64>,
    pub total_bytes: Option<f64>,
    pub speed: String,
    pub speed_bytes: Option<f64>,
    pub eta: String,
    pub output_file: Option<PathBuf>,
    pub filename: Option<String>,
    pub stage: Option<ProcessingStage>,
}

impl Default for ProgressFacts {
    fn default() -> Self {
        Self {
            percent: 0.0,
            downloaded_bytes: None,
            total_bytes: None,
            speed: CALCULATING.to_string(),
            speed_bytes: None,
            eta: CALCULATING.to_string(),
            output_file: None,
            filename: None,
            stage: None,
        }
    }
}

impl ProgressFacts {
    fn set_output(&mut self, path: &str) {
        let path = PathBuf::from(path.trim().trim_matches('"'));
        self.filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        self.output_file = Some(path);
    }
}

/// Folds `line` into `prior` and returns the updated facts.
pub fn parse_line(line: &str, prior: &ProgressFacts) -> ProgressFacts {
    let mut facts = prior.clone();
    let line = line.trim();
    if line.is_empty() {
        return facts;
    }

    if let Some(stage) = stage_marker(line) {
        facts.stage = Some(stage);
    }
    if let Some(caps) = MERGE_TARGET_RE.captures(line) {
        facts.set_output(&caps[1]);
        return facts;
    }
    if let Some((_, destination)) = line.split_once(DESTINATION_MARKER) {
        if !destination.trim().is_empty() {
            facts.set_output(destination);
        }
        return facts;
    }

    if let Some(caps) = PERCENT_RE.captures(line) {
        let reported = caps[1].parse::<f64>().unwrap_or(facts.percent);
        apply_sizes(line, reported, &mut facts);
    }

    if let Some(caps) = RATE_RE.captures(line) {
        let value = &caps[1];
        let unit = &caps[2];
        if let Some(bytes) = parse_size(value, unit) {
            facts.speed = format!("{value}{unit}/s");
            facts.speed_bytes = Some(bytes);
        }
    }

    if let Some(caps) = ETA_RE.captures(line) {
        let value = &caps[1];
        facts.eta = if value.eq_ignore_ascii_case("unknown") {
            estimate_eta(&facts).unwrap_or_else(|| CALCULATING.to_string())
        } else {
            value.to_string()
        };
    }

    facts
}

fn apply_sizes(line: &str, reported: f64, facts: &mut ProgressFacts) {
    if let Some(caps) = SIZE_PAIR_RE.captures(line) {
        let downloaded = parse_size(&caps[1], &caps[2]);
        let total = parse_size(&caps[3], &caps[4]);
        if let (Some(downloaded), Some(total)) = (downloaded, total) {
            facts.downloaded_bytes = Some(downloaded);
            facts.total_bytes = Some(total);
            facts.percent = if total > 0.0 {
                downloaded / total * 100.0
            } else {
                reported
            };
            return;
        }
    }

    facts.percent = reported;
    if let Some(caps) = TOTAL_RE.captures(line)
        && let Some(total) = parse_size(&caps[1], &caps[2])
    {
        facts.total_bytes = Some(total);
        facts.downloaded_bytes = Some(total * reported / 100.0);
    }
}

fn stage_marker(line: &str) -> Option<ProcessingStage> {
    if MERGE_MARKERS.iter().any(|marker| line.contains(marker)) {
        Some(ProcessingStage::Merging)
    } else if CONVERT_MARKERS.iter().any(|marker| line.contains(marker)) {
        Some(ProcessingStage::Converting)
    } else {
        None
    }
}

fn estimate_eta(facts: &ProgressFacts) -> Option<String> {
    let rate = facts.speed_bytes.filter(|rate| *rate > 0.0)?;
    let downloaded = facts.downloaded_bytes?;
    let total = facts.total_bytes?;
    if downloaded >= total {
        return None;
    }
    Some(format_eta(((total - downloaded) / rate) as u64))
}

/// Formats seconds as `MM:SS`, or `H:MM:SS` past the hour.
pub fn format_eta(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

/// Converts a `1.5` + `MiB` pair into bytes. Units are case-insensitive.
pub fn parse_size(value: &str, unit: &str) -> Option<f64> {
    let value = value.trim().parse::<f64>().ok()?;
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "b" => 1.0,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * multiplier)
}
