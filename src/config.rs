use crate::error::{Result, SyncError};
use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration, loaded from a TOML file. Every field has a default so
/// an empty file (or a missing optional section) is valid.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub lyrics: LyricsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    /// mp3, flac or m4a
    #[serde(default = "default_format")]
    pub format: String,
    /// low, medium or high
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Per-download timeout, seconds.
    #[serde(default = "default_download_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_true")]
    pub trim_silence: bool,
    #[serde(default)]
    pub normalize: bool,
    #[serde(default = "default_min_duration")]
    pub min_duration: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration: u64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default = "default_true")]
    pub prefer_official: bool,
    #[serde(default = "default_true")]
    pub exclude_live: bool,
    #[serde(default = "default_true")]
    pub exclude_covers: bool,
    /// Seconds of slack before duration differences start costing points.
    #[serde(default = "default_duration_tolerance")]
    pub duration_tolerance: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LyricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub download_separate_files: bool,
    #[serde(default = "default_true")]
    pub embed_in_audio: bool,
    /// txt, lrc or both
    #[serde(default = "default_lyrics_format")]
    pub format: String,
    #[serde(default = "default_primary_source")]
    pub primary_source: String,
    #[serde(default = "default_fallback_sources")]
    pub fallback_sources: Vec<String>,
    #[serde(default = "default_true")]
    pub clean_lyrics: bool,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_lyrics_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default = "default_true")]
    pub sync_lyrics: bool,
    #[serde(default = "default_true")]
    pub backup_tracklist: bool,
    #[serde(default = "default_true")]
    pub detect_moved_tracks: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    #[serde(default = "default_true")]
    pub include_album_art: bool,
    #[serde(default = "default_true")]
    pub include_source_metadata: bool,
    #[serde(default)]
    pub preserve_original_tags: bool,
    #[serde(default = "default_true")]
    pub add_comment: bool,
    #[serde(default = "default_id3_version")]
    pub id3_version: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NamingConfig {
    /// Tokens: {track}, {artist}, {title}, {album}
    #[serde(default = "default_track_format")]
    pub track_format: String,
    #[serde(default = "default_true")]
    pub sanitize_filenames: bool,
    #[serde(default = "default_max_filename_length")]
    pub max_filename_length: usize,
    #[serde(default)]
    pub replace_spaces: bool,
}

fn default_output_directory() -> String { "~/Music/Playlist Mirrors".into() }
fn default_format() -> String { "m4a".into() }
fn default_quality() -> String { "high".into() }
fn default_bitrate() -> u32 { 320 }
fn default_concurrency() -> usize { 3 }
fn default_retry_attempts() -> u32 { 3 }
fn default_download_timeout() -> u64 { 300 }
fn default_true() -> bool { true }
fn default_min_duration() -> u64 { 30 }
fn default_max_duration() -> u64 { 960 }
fn default_sample_rate() -> u32 { 44100 }
fn default_channels() -> u32 { 2 }
fn default_max_results() -> usize { 5 }
fn default_score_threshold() -> f64 { 70.0 }
fn default_duration_tolerance() -> u64 { 15 }
fn default_lyrics_format() -> String { "lrc".into() }
fn default_primary_source() -> String { "lrclib".into() }
fn default_fallback_sources() -> Vec<String> { vec!["ovh".into(), "musixmatch".into()] }
fn default_min_length() -> usize { 50 }
fn default_lyrics_timeout() -> u64 { 30 }
fn default_max_attempts() -> u32 { 3 }
fn default_similarity_threshold() -> f64 { 0.7 }
fn default_id3_version() -> String { "2.4".into() }
fn default_encoding() -> String { "utf-8".into() }
fn default_track_format() -> String { "{track} - {artist} - {title}".into() }
fn default_max_filename_length() -> usize { 200 }

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("music-playlist-offline-sync")
        .join("sync.db")
}

fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("music-playlist-offline-sync")
        .join("logs")
}

impl Default for OutputConfig {
    fn default() -> Self { toml_default() }
}
impl Default for AudioConfig {
    fn default() -> Self { toml_default() }
}
impl Default for MatchingConfig {
    fn default() -> Self { toml_default() }
}
impl Default for LyricsConfig {
    fn default() -> Self { toml_default() }
}
impl Default for SyncConfig {
    fn default() -> Self { toml_default() }
}
impl Default for MetadataConfig {
    fn default() -> Self { toml_default() }
}
impl Default for NamingConfig {
    fn default() -> Self { toml_default() }
}

/// Deserialize a section from an empty table so the serde defaults apply.
fn toml_default<T: for<'de> Deserialize<'de>>() -> T {
    toml::from_str("").expect("section defaults")
}

impl Config {
    /// All-defaults configuration (equivalent to an empty config file).
    pub fn defaults() -> Self {
        toml::from_str("").expect("defaults")
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&std::path::Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_path(p),
            None => Ok(Self::defaults()),
        }
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let cfg: Config = toml::from_str(&s)
            .map_err(|e| SyncError::Config(format!("invalid config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.output.format.as_str(), "mp3" | "flac" | "m4a") {
            return Err(SyncError::Config(format!(
                "unsupported output format: {} (expected mp3, flac or m4a)",
                self.output.format
            )));
        }
        if !matches!(self.output.quality.as_str(), "low" | "medium" | "high") {
            return Err(SyncError::Config(format!(
                "invalid quality: {} (expected low, medium or high)",
                self.output.quality
            )));
        }
        if self.output.concurrency == 0 {
            return Err(SyncError::Config("concurrency must be >= 1".into()));
        }
        if !matches!(self.lyrics.format.as_str(), "txt" | "lrc" | "both") {
            return Err(SyncError::Config(format!(
                "invalid lyrics format: {} (expected txt, lrc or both)",
                self.lyrics.format
            )));
        }
        if self.audio.min_duration >= self.audio.max_duration {
            return Err(SyncError::Config(
                "min_duration must be smaller than max_duration".into(),
            ));
        }
        Ok(())
    }

    /// Output root with `~` expanded.
    pub fn output_root(&self) -> PathBuf {
        crate::util::expand_tilde(&self.output.output_directory)
    }

    /// Source platform credentials come from the environment.
    pub fn source_client_credentials() -> (String, String) {
        (
            std::env::var("SOURCE_CLIENT_ID").unwrap_or_default(),
            std::env::var("SOURCE_CLIENT_SECRET").unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.output.format, "m4a");
        assert_eq!(cfg.output.concurrency, 3);
        assert_eq!(cfg.matching.duration_tolerance, 15);
        assert_eq!(cfg.lyrics.primary_source, "lrclib");
        assert_eq!(cfg.naming.max_filename_length, 200);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_section_override() {
        let cfg: Config = toml::from_str("[output]\nformat = \"mp3\"\nconcurrency = 8\n").unwrap();
        assert_eq!(cfg.output.format, "mp3");
        assert_eq!(cfg.output.concurrency, 8);
        assert_eq!(cfg.output.bitrate, 320);
    }

    #[test]
    fn invalid_values_rejected() {
        let cfg: Config = toml::from_str("[output]\nformat = \"ogg\"\n").unwrap();
        assert!(cfg.validate().is_err());
        let cfg: Config = toml::from_str("[output]\nconcurrency = 0\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
