//! Recognizes YouTube video URLs and pulls out the 11-character video id.
//!
//! Anything that fails to parse, points at another host, or lacks an id of the
//! expected shape yields `None`; callers turn that into `InvalidInput`.

use url::Url;

const VIDEO_ID_LEN: usize = 11;

const WATCH_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
];

const SHORT_HOST: &str = "youtu.be";

const PATH_PREFIXES: &[&str] = &["shorts", "embed", "v", "live"];

/// Returns the canonical video id when `input` is a plausible video URL.
pub fn extract_video_id(input: &str) -> Option<String> {
    let parsed = Url::parse(input.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();

    let candidate = if host == SHORT_HOST {
        parsed.path_segments()?.next().map(str::to_string)
    } else if WATCH_HOSTS.contains(&host.as_str()) {
        id_from_watch_url(&parsed)
    } else {
        None
    }?;

    is_video_id(&candidate).then_some(candidate)
}

pub fn is_valid_video_url(input: &str) -> bool {
    extract_video_id(input).is_some()
}

fn id_from_watch_url(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    match segments.next()? {
        "watch" => url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned()),
        prefix if PATH_PREFIXES.contains(&prefix) => segments.next().map(str::to_string),
        _ => None,
    }
}

fn is_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_shapes() {
        let cases = [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "http://m.youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ?si=abc",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ",
            "  https://www.youtube.com/live/dQw4w9WgXcQ  ",
        ];
        for case in cases {
            assert_eq!(
                extract_video_id(case).as_deref(),
                Some("dQw4w9WgXcQ"),
                "{case}"
            );
        }
    }

    #[test]
    fn rejects_foreign_or_malformed() {
        let cases = [
            "",
            "not a url",
            "ftp://youtu.be/dQw4w9WgXcQ",
            "https://vimeo.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com.evil.example/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/watch?v=short",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQX",
            "https://www.youtube.com/watch",
            "https://youtu.be/",
            "https://www.youtube.com/channel/UCabcdefghijk",
            "https://youtu.be/dQw4w9WgX!Q",
        ];
        for case in cases {
            assert!(!is_valid_video_url(case), "{case}");
        }
    }

    #[test]
    fn spec_example_is_valid() {
        assert_eq!(
            extract_video_id("https://youtu.be/ABCDEFGHIJK").as_deref(),
            Some("ABCDEFGHIJK")
        );
    }
}
