//! Audio acquisition via the `yt-dlp` binary: format-selector cascade,
//! staging-directory extraction, atomic move to the final path, bounded
//! start rate and an outer retry layer for transient failures.

use crate::config::{AudioConfig, OutputConfig};
use crate::error::{Result, SyncError};
use crate::http::{retry_with_backoff, Throttle};
use crate::util;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

const STAGING_SWEEP_AGE: Duration = Duration::from_secs(3600);
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "opus", "webm", "ogg"];

/// Error fragments that mean "this format selector is unavailable, try the
/// next one" rather than a hard failure.
const FORMAT_ERROR_MARKERS: &[&str] = &[
    "Requested format is not available",
    "format not available",
    "HTTP Error 403",
    "HTTP Error 429",
    "Unable to extract",
];

static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[download\]\s+(\d+(?:\.\d+)?)%\s+of\s+~?\s*([\d.]+)(KiB|MiB|GiB|B)(?:\s+at\s+([\d.]+)(KiB|MiB|GiB|B)/s)?(?:\s+ETA\s+(\d+):(\d+))?",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloading,
    Finished,
    Error,
}

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub video_id: String,
    pub bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_s: Option<f64>,
    pub eta: Option<Duration>,
    pub status: DownloadStatus,
}

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub duration_s: Option<u64>,
    pub elapsed: Duration,
}

pub struct AudioDownloader {
    output: OutputConfig,
    audio: AudioConfig,
    staging_dir: PathBuf,
    throttle: Throttle,
}

impl AudioDownloader {
    pub fn new(output: OutputConfig, audio: AudioConfig) -> Result<Self> {
        let staging_dir = std::env::temp_dir().join("music-playlist-offline-sync");
        std::fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            output,
            audio,
            staging_dir,
            throttle: Throttle::new(Duration::from_millis(500)),
        })
    }

    #[cfg(test)]
    pub fn with_staging_dir(output: OutputConfig, audio: AudioConfig, staging: PathBuf) -> Self {
        Self {
            output,
            audio,
            staging_dir: staging,
            throttle: Throttle::new(Duration::from_millis(500)),
        }
    }

    /// Progressive fallback format selectors, most specific first.
    pub fn format_selectors(&self) -> Vec<String> {
        match self.output.format.as_str() {
            "m4a" => vec![
                "bestaudio[ext=m4a]/bestaudio[acodec=aac]/bestaudio".into(),
                "bestaudio[ext=m4a][abr<=256]/bestaudio[acodec=aac][abr<=256]/bestaudio[abr<=256]"
                    .into(),
                "bestaudio/best[height<=720]".into(),
                "bestaudio/best".into(),
            ],
            "mp3" => vec![
                "bestaudio[acodec!=opus]/best[height<=720]".into(),
                "bestaudio[abr<=320]/best[height<=480]".into(),
                "bestaudio/best[height<=720]".into(),
                "bestaudio/best".into(),
            ],
            _ => vec![
                "bestaudio[acodec!=opus]/best[height<=720]".into(),
                "bestaudio/best[height<=720]".into(),
                "bestaudio/best".into(),
            ],
        }
    }

    fn audio_quality_value(&self) -> String {
        // mp3 re-encodes, so the configured bitrate applies directly; the
        // other formats use yt-dlp's 0 (best) to 9 (worst) scale.
        if self.output.format == "mp3" {
            return format!("{}K", self.output.bitrate);
        }
        match self.output.quality.as_str() {
            "low" => "9".into(),
            "medium" => "5".into(),
            _ => "0".into(),
        }
    }

    fn watch_url(video_id: &str) -> String {
        format!("https://youtube.com/watch?v={}", video_id)
    }

    /// Metadata-only probe (no bytes downloaded).
    pub async fn fetch_info(&self, video_id: &str) -> Result<serde_json::Value> {
        let output = Command::new("yt-dlp")
            .arg("--dump-json")
            .arg("--no-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(Self::watch_url(video_id))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SyncError::Download(format!("failed to run yt-dlp: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Download(format!(
                "metadata fetch failed: {}",
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| SyncError::Download(format!("unreadable metadata: {}", e)))
    }

    fn validate_duration(&self, info: &serde_json::Value) -> Result<Option<u64>> {
        let duration = info["duration"].as_f64().map(|d| d as u64);
        if let Some(d) = duration {
            if d > 0 {
                if d < self.audio.min_duration {
                    return Err(SyncError::Download(format!(
                        "Track too short: {}s (min: {}s)",
                        d, self.audio.min_duration
                    )));
                }
                if d > self.audio.max_duration {
                    return Err(SyncError::Download(format!(
                        "Track too long: {}s (max: {}s)",
                        d, self.audio.max_duration
                    )));
                }
            }
        }
        Ok(duration)
    }

    /// Download audio for `video_id` to `<base_path><ext>`. The whole
    /// operation is retried up to 3 times with exponential backoff for
    /// transient errors; format-availability and duration-bound errors are
    /// terminal.
    pub async fn download(
        &self,
        video_id: &str,
        base_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        let attempts = self.output.retry_attempts.max(1);
        let result = retry_with_backoff(
            attempts,
            Duration::from_secs(2),
            |e| is_retryable(e),
            || self.download_once(video_id, base_path, progress.clone()),
        )
        .await;
        if let Err(e) = &result {
            self.cleanup_staged(video_id);
            if let Some(cb) = &progress {
                cb(DownloadProgress {
                    video_id: video_id.to_string(),
                    bytes: 0,
                    total_bytes: None,
                    speed_bytes_per_s: None,
                    eta: None,
                    status: DownloadStatus::Error,
                });
            }
            warn!("download failed: {} - {}", video_id, e);
        }
        result
    }

    async fn download_once(
        &self,
        video_id: &str,
        base_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        let start = Instant::now();
        self.throttle.wait().await;

        if let Some(parent) = base_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let info = self.fetch_info(video_id).await?;
        let duration = self.validate_duration(&info)?;

        let selectors = self.format_selectors();
        let mut last_error: Option<SyncError> = None;
        let mut succeeded = false;
        for (attempt, selector) in selectors.iter().enumerate() {
            if attempt > 0 {
                debug!(
                    "download attempt {}/{} with format: {}",
                    attempt + 1,
                    selectors.len(),
                    selector
                );
            }
            match self.run_extraction(video_id, selector, progress.clone()).await {
                Ok(()) => {
                    succeeded = true;
                    break;
                }
                Err(e) => {
                    let message = e.to_string();
                    let format_error =
                        FORMAT_ERROR_MARKERS.iter().any(|m| message.contains(m));
                    if format_error && attempt + 1 < selectors.len() {
                        debug!("format attempt {} failed: {}, trying next", attempt + 1, message);
                        last_error = Some(e);
                        continue;
                    }
                    self.cleanup_staged(video_id);
                    return Err(e);
                }
            }
        }
        if !succeeded {
            self.cleanup_staged(video_id);
            return Err(last_error
                .unwrap_or_else(|| SyncError::Download("all format selectors exhausted".into())));
        }

        let staged = self.find_staged_file(video_id).ok_or_else(|| {
            SyncError::Download("extracted file not found in staging directory".into())
        })?;

        let extension = util::file_extension_for(&self.output.format);
        let final_path = unique_target_path(base_path, extension);
        std::fs::rename(&staged, &final_path).map_err(|e| {
            SyncError::Download(format!("failed to move into place: {}", e))
        })?;

        let file_size = std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
        if file_size == 0 {
            let _ = std::fs::remove_file(&final_path);
            return Err(SyncError::Download("extracted file is empty".into()));
        }

        if let Some(cb) = &progress {
            cb(DownloadProgress {
                video_id: video_id.to_string(),
                bytes: file_size,
                total_bytes: Some(file_size),
                speed_bytes_per_s: None,
                eta: None,
                status: DownloadStatus::Finished,
            });
        }

        debug!(
            "download completed: {} -> {} ({} bytes, {:.1}s)",
            video_id,
            final_path.display(),
            file_size,
            start.elapsed().as_secs_f64()
        );
        Ok(DownloadOutcome {
            file_path: final_path,
            file_size,
            duration_s: duration,
            elapsed: start.elapsed(),
        })
    }

    async fn run_extraction(
        &self,
        video_id: &str,
        selector: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let template = self
            .staging_dir
            .join(format!("{}_%(title)s.%(ext)s", video_id));
        let mut child = Command::new("yt-dlp")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--newline")
            .arg("-f")
            .arg(selector)
            .arg("-x")
            .arg("--audio-format")
            .arg(&self.output.format)
            .arg("--audio-quality")
            .arg(&self.audio_quality_value())
            .arg("-o")
            .arg(&template)
            .arg(Self::watch_url(video_id))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SyncError::Download(format!("failed to run yt-dlp: {}", e)))?;

        let stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let video_id_owned = video_id.to_string();
        let progress_task = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut last_logged: u64 = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(event) = parse_progress_line(&video_id_owned, &line) {
                    // Log roughly once per megabyte.
                    if event.bytes >= last_logged + 1024 * 1024 {
                        last_logged = event.bytes;
                        debug!(
                            "downloading {}: {} / {:?} bytes",
                            event.video_id, event.bytes, event.total_bytes
                        );
                    }
                    if let Some(cb) = &progress {
                        cb(event);
                    }
                }
            }
        });

        let timeout = Duration::from_secs(self.output.timeout);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(res) => res.map_err(|e| SyncError::Download(format!("yt-dlp wait failed: {}", e)))?,
            Err(_) => {
                let _ = child.kill().await;
                let _ = progress_task.await;
                return Err(SyncError::Download(format!(
                    "download timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };
        let _ = progress_task.await;

        if !status.success() {
            let mut err_text = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut err_text).await;
            }
            return Err(SyncError::Download(format!(
                "extraction failed: {}",
                err_text.trim()
            )));
        }
        Ok(())
    }

    fn find_staged_file(&self, video_id: &str) -> Option<PathBuf> {
        let prefix = format!("{}_", video_id);
        let entries = std::fs::read_dir(&self.staging_dir).ok()?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if name.starts_with(&prefix) && AUDIO_EXTENSIONS.contains(&ext) {
                return Some(path);
            }
        }
        None
    }

    /// Remove any staged files for this id. Idempotent.
    pub fn cleanup_staged(&self, video_id: &str) {
        let prefix = format!("{}_", video_id);
        let Ok(entries) = std::fs::read_dir(&self.staging_dir) else { return };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if path.is_file() && name.starts_with(&prefix) {
                if std::fs::remove_file(&path).is_ok() {
                    debug!("cleaned up staged file: {}", name);
                }
            }
        }
    }

    /// Purge staging files older than one hour.
    pub fn sweep_staging(&self) {
        let Ok(entries) = std::fs::read_dir(&self.staging_dir) else { return };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .map(|age| age > STAGING_SWEEP_AGE)
                .unwrap_or(false);
            if old {
                if std::fs::remove_file(&path).is_ok() {
                    debug!("swept stale staging file: {}", path.display());
                }
            }
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}

/// Terminal errors: duration bounds and exhausted/unsupported formats.
/// Everything else (network hiccups, timeouts, subprocess trouble) is
/// worth the outer retry.
fn is_retryable(e: &SyncError) -> bool {
    match e {
        SyncError::Download(message) => {
            !(message.starts_with("Track too short")
                || message.starts_with("Track too long")
                || FORMAT_ERROR_MARKERS.iter().any(|m| message.contains(m)))
        }
        other => other.is_transient(),
    }
}

fn unique_target_path(base_path: &Path, extension: &str) -> PathBuf {
    let mut candidate = PathBuf::from(format!("{}{}", base_path.display(), extension));
    let mut counter = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}_{}{}", base_path.display(), counter, extension));
        counter += 1;
    }
    candidate
}

fn parse_size(value: f64, unit: &str) -> u64 {
    let factor = match unit {
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * factor) as u64
}

fn parse_progress_line(video_id: &str, line: &str) -> Option<DownloadProgress> {
    let caps = PROGRESS_LINE.captures(line)?;
    let pct: f64 = caps[1].parse().ok()?;
    let total = parse_size(caps[2].parse().ok()?, &caps[3]);
    let speed = caps
        .get(4)
        .zip(caps.get(5))
        .and_then(|(v, u)| v.as_str().parse::<f64>().ok().map(|n| parse_size(n, u.as_str()) as f64));
    let eta = caps.get(6).zip(caps.get(7)).and_then(|(m, s)| {
        let minutes: u64 = m.as_str().parse().ok()?;
        let seconds: u64 = s.as_str().parse().ok()?;
        Some(Duration::from_secs(minutes * 60 + seconds))
    });
    Some(DownloadProgress {
        video_id: video_id.to_string(),
        bytes: (total as f64 * pct / 100.0) as u64,
        total_bytes: Some(total),
        speed_bytes_per_s: speed,
        eta,
        status: DownloadStatus::Downloading,
    })
}
