//! Process-wide settings, read once at start from flags or the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Directory created under the temp root to hold all workspaces.
pub const WORKSPACE_DIR_NAME: &str = "mediabox";

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Root for per-request workspaces (defaults to the system temp dir)
    #[arg(long, env = "TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Maximum size of a single uploaded file in MB
    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value = "500",
          value_parser = clap::value_parser!(u64).range(1..))]
    pub max_file_size_mb: u64,

    /// Wall-clock limit for one ffmpeg invocation
    #[arg(long, env = "FFMPEG_TIMEOUT_SECONDS", default_value = "300",
          value_parser = clap::value_parser!(u64).range(1..))]
    pub ffmpeg_timeout_seconds: u64,

    /// ffmpeg executable to run
    #[arg(long, env = "FFMPEG_BIN", default_value = "ffmpeg")]
    pub ffmpeg_bin: PathBuf,

    /// Font exposed to command templates as {font}
    #[arg(long, env = "FONT_PATH", default_value = "fonts/OpenSans.ttf")]
    pub font_path: PathBuf,

    /// Maximum number of files accepted in one request
    #[arg(long, env = "MAX_FILES", default_value = "10")]
    pub max_files: usize,
}

impl Config {
    /// Directory under which every workspace is created.
    pub fn workspace_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(WORKSPACE_DIR_NAME)
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.ffmpeg_timeout_seconds)
    }

    /// Whole-request body ceiling: every allowed file at full size plus form fields.
    pub fn body_limit(&self) -> usize {
        let files = self.max_file_bytes().saturating_mul(self.max_files.max(1) as u64);
        usize::try_from(files.saturating_add(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_dir: None,
            max_file_size_mb: 500,
            ffmpeg_timeout_seconds: 300,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            font_path: PathBuf::from("fonts/OpenSans.ttf"),
            max_files: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults_match_documented_values() {
        let parsed = Harness::try_parse_from(["mediabox"]).unwrap().config;
        assert_eq!(parsed.max_file_size_mb, 500);
        assert_eq!(parsed.ffmpeg_timeout_seconds, 300);
        assert_eq!(parsed.ffmpeg_bin, PathBuf::from("ffmpeg"));
        assert_eq!(parsed.max_files, 10);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(Harness::try_parse_from(["mediabox", "--ffmpeg-timeout-seconds", "0"]).is_err());
    }

    #[test]
    fn workspace_root_nests_under_temp_dir() {
        let config = Config {
            temp_dir: Some(PathBuf::from("/srv/scratch")),
            ..Config::default()
        };
        assert_eq!(config.workspace_root(), PathBuf::from("/srv/scratch/mediabox"));
        assert_eq!(config.max_file_bytes(), 500 * 1024 * 1024);
    }
}
