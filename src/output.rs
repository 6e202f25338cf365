//! Choosing the artifact's extension, content type and download name.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_EXTENSION: &str = ".mp4";

/// Extensions a caller may request, with the content type served for each.
const KNOWN_EXTENSIONS: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
    ("avi", "video/x-msvideo"),
    ("mov", "video/quicktime"),
    ("flv", "video/x-flv"),
    ("wmv", "video/x-ms-wmv"),
    ("m4v", "video/x-m4v"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("aac", "audio/aac"),
    ("flac", "audio/flac"),
    ("ogg", "audio/ogg"),
    ("m4a", "audio/mp4"),
    ("wma", "audio/x-ms-wma"),
    ("gif", "image/gif"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("tiff", "image/tiff"),
];

/// `-f <format>` muxer names that map onto a file extension.
const FORMAT_EXTENSIONS: &[(&str, &str)] = &[
    ("mp4", ".mp4"),
    ("webm", ".webm"),
    ("mkv", ".mkv"),
    ("matroska", ".mkv"),
    ("avi", ".avi"),
    ("mov", ".mov"),
    ("mp3", ".mp3"),
    ("wav", ".wav"),
    ("aac", ".aac"),
    ("flac", ".flac"),
    ("ogg", ".ogg"),
    ("gif", ".gif"),
    ("png", ".png"),
    ("jpg", ".jpg"),
    ("jpeg", ".jpg"),
    ("webp", ".webp"),
];

static FORMAT_FLAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[\s"',\[])-f["',\s]+(\w+)"#).expect("format flag pattern is valid")
});

/// Normalise a caller-supplied extension; `None` if it is not allowlisted.
pub fn normalize_extension(requested: &str) -> Option<String> {
    let clean = requested.trim().trim_start_matches('.').to_ascii_lowercase();
    KNOWN_EXTENSIONS
        .iter()
        .any(|(ext, _)| *ext == clean)
        .then(|| format!(".{clean}"))
}

/// Guess the intended output format from flags in the raw command.
pub fn detect_extension(raw_command: &str) -> Option<&'static str> {
    for caps in FORMAT_FLAG.captures_iter(raw_command) {
        let format = caps[1].to_ascii_lowercase();
        if let Some((_, ext)) = FORMAT_EXTENSIONS.iter().find(|(name, _)| *name == format) {
            return Some(*ext);
        }
    }

    let lower = raw_command.to_ascii_lowercase();
    let compact = lower.replace(['"', ','], " ");
    let compact = compact.split_whitespace().collect::<Vec<_>>().join(" ");
    if ["-acodec mp3", "-c:a mp3", "libmp3lame"]
        .iter()
        .any(|hint| compact.contains(hint))
    {
        return Some(".mp3");
    }
    if (compact.contains("-vn") || compact.contains("-an")) && compact.contains("mp3") {
        return Some(".mp3");
    }
    if compact.contains("-vframes 1") || compact.contains("-frames:v 1") {
        return Some(".jpg");
    }
    None
}

/// Requested extension, then command hints, then the first input's, then `.mp4`.
pub fn resolve_extension(
    requested: Option<&str>,
    raw_command: &str,
    first_input: Option<&str>,
) -> String {
    requested
        .and_then(normalize_extension)
        .or_else(|| detect_extension(raw_command).map(str::to_string))
        .or_else(|| {
            first_input
                .and_then(|name| Path::new(name).extension())
                .and_then(|ext| normalize_extension(&ext.to_string_lossy()))
        })
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

pub fn content_type(extension: &str) -> &'static str {
    let bare = extension.trim_start_matches('.');
    KNOWN_EXTENSIONS
        .iter()
        .find(|(ext, _)| ext.eq_ignore_ascii_case(bare))
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

/// `<stem>_processed<ext>` for a single upload, `processed<ext>` otherwise.
pub fn download_name(original_names: &[String], extension: &str) -> String {
    let stem = match original_names {
        [only] => Path::new(only)
            .file_stem()
            .map(|stem| {
                stem.to_string_lossy()
                    .chars()
                    .filter(|c| (c.is_ascii_graphic() || *c == ' ') && !matches!(c, '"' | '\\' | '/'))
                    .collect::<String>()
            })
            .filter(|stem| !stem.trim().is_empty()),
        _ => None,
    };
    match stem {
        Some(stem) => format!("{stem}_processed{extension}"),
        None => format!("processed{extension}"),
    }
}
