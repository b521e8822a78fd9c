//! Optional post-download audio processing via ffmpeg: silence trim and
//! two-pass EBU R128 loudness normalization. Both are best-effort; a
//! missing ffmpeg degrades to a no-op and failures never fail the track.

use crate::config::AudioConfig;
use crate::error::{Result, SyncError};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

const SILENCE_NOISE_DB: &str = "-40dB";
const SILENCE_MIN_LEN_S: f64 = 1.0;
const TRIM_PADDING_S: f64 = 0.5;
const MIN_TRIMMED_S: f64 = 1.0;
const LOUDNORM_TARGET: &str = "I=-23:TP=-1:LRA=7";

static SILENCE_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"silence_start:\s*([\d.]+)").unwrap());
static SILENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"silence_end:\s*([\d.]+)").unwrap());
static DURATION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Duration:\s*(\d+):(\d+):(\d+(?:\.\d+)?)").unwrap());

pub struct AudioProcessor {
    cfg: AudioConfig,
}

impl AudioProcessor {
    pub fn new(cfg: AudioConfig) -> Self {
        Self { cfg }
    }

    /// Run the enabled processing steps over the file in place. Never
    /// returns an error; problems are logged and the original file is kept.
    pub async fn process(&self, path: &Path) {
        if !self.cfg.trim_silence && !self.cfg.normalize {
            return;
        }
        if !ffmpeg_available().await {
            warn!("ffmpeg not found; skipping audio processing");
            return;
        }
        if self.cfg.trim_silence {
            if let Err(e) = self.trim_silence(path).await {
                warn!("silence trim failed for {}: {}", path.display(), e);
            }
        }
        if self.cfg.normalize {
            if let Err(e) = self.normalize(path).await {
                warn!("loudness normalization failed for {}: {}", path.display(), e);
            }
        }
    }

    async fn trim_silence(&self, path: &Path) -> Result<()> {
        let detect = run_ffmpeg(&[
            "-i",
            path.to_str().unwrap_or_default(),
            "-af",
            &format!("silencedetect=noise={}:d={}", SILENCE_NOISE_DB, SILENCE_MIN_LEN_S),
            "-f",
            "null",
            "-",
        ])
        .await?;

        let Some(total) = parse_media_duration(&detect) else {
            return Err(SyncError::Download("could not determine media duration".into()));
        };
        let spans = parse_silence_spans(&detect, total);
        let Some((start, end)) = trim_bounds(&spans, total) else {
            debug!("no trimmable silence in {}", path.display());
            return Ok(());
        };

        let tmp = hidden_sibling(path);
        run_ffmpeg(&[
            "-y",
            "-i",
            path.to_str().unwrap_or_default(),
            "-ss",
            &format!("{:.3}", start),
            "-to",
            &format!("{:.3}", end),
            "-c",
            "copy",
            tmp.to_str().unwrap_or_default(),
        ])
        .await?;
        std::fs::rename(&tmp, path)?;
        debug!(
            "trimmed {} to {:.1}s..{:.1}s (of {:.1}s)",
            path.display(),
            start,
            end,
            total
        );
        Ok(())
    }

    async fn normalize(&self, path: &Path) -> Result<()> {
        let pass1 = run_ffmpeg(&[
            "-i",
            path.to_str().unwrap_or_default(),
            "-af",
            &format!("loudnorm={}:print_format=json", LOUDNORM_TARGET),
            "-f",
            "null",
            "-",
        ])
        .await?;
        let measured = extract_loudnorm_json(&pass1)
            .ok_or_else(|| SyncError::Download("loudnorm measurement missing".into()))?;

        let filter = format!(
            "loudnorm={}:measured_I={}:measured_TP={}:measured_LRA={}:measured_thresh={}:offset={}:linear=true",
            LOUDNORM_TARGET,
            measured["input_i"].as_str().unwrap_or("0"),
            measured["input_tp"].as_str().unwrap_or("0"),
            measured["input_lra"].as_str().unwrap_or("0"),
            measured["input_thresh"].as_str().unwrap_or("0"),
            measured["target_offset"].as_str().unwrap_or("0"),
        );
        let tmp = hidden_sibling(path);
        run_ffmpeg(&[
            "-y",
            "-i",
            path.to_str().unwrap_or_default(),
            "-af",
            &filter,
            "-ar",
            &self.cfg.sample_rate.to_string(),
            "-ac",
            &self.cfg.channels.to_string(),
            tmp.to_str().unwrap_or_default(),
        ])
        .await?;
        std::fs::rename(&tmp, path)?;
        debug!("normalized {}", path.display());
        Ok(())
    }
}

async fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run ffmpeg and return its stderr (where it writes all diagnostics).
/// Detection filters exit zero; encode runs must succeed.
async fn run_ffmpeg(args: &[&str]) -> Result<String> {
    let output = Command::new("ffmpeg")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SyncError::Download(format!("failed to run ffmpeg: {}", e)))?;
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(SyncError::Download(format!(
            "ffmpeg failed: {}",
            stderr.lines().last().unwrap_or("").trim()
        )));
    }
    Ok(stderr)
}

fn hidden_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("audio.tmp");
    path.with_file_name(format!(".{}", name))
}

/// (start, end) pairs of detected silence; an unterminated final span runs
/// to the end of the media.
pub(crate) fn parse_silence_spans(stderr: &str, total: f64) -> Vec<(f64, f64)> {
    let starts: Vec<f64> = SILENCE_START
        .captures_iter(stderr)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    let ends: Vec<f64> = SILENCE_END
        .captures_iter(stderr)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    starts
        .iter()
        .enumerate()
        .map(|(i, &s)| (s, ends.get(i).copied().unwrap_or(total)))
        .collect()
}

pub(crate) fn parse_media_duration(stderr: &str) -> Option<f64> {
    let caps = DURATION_LINE.captures(stderr)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Non-silent region with padding, or None when less than a second of
/// silence would be removed.
pub(crate) fn trim_bounds(spans: &[(f64, f64)], total: f64) -> Option<(f64, f64)> {
    let lead_end = spans
        .first()
        .filter(|(s, _)| *s <= 0.1)
        .map(|(_, e)| *e)
        .unwrap_or(0.0);
    let tail_start = spans
        .last()
        .filter(|(_, e)| *e >= total - 0.1)
        .map(|(s, _)| *s)
        .unwrap_or(total);

    let removed = lead_end + (total - tail_start);
    if removed <= MIN_TRIMMED_S || tail_start <= lead_end {
        return None;
    }
    let start = (lead_end - TRIM_PADDING_S).max(0.0);
    let end = (tail_start + TRIM_PADDING_S).min(total);
    Some((start, end))
}

/// The loudnorm JSON block ffmpeg prints at the end of pass one.
pub(crate) fn extract_loudnorm_json(stderr: &str) -> Option<serde_json::Value> {
    let start = stderr.rfind('{')?;
    let end = stderr[start..].find('}')? + start + 1;
    serde_json::from_str(&stderr[start..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETECT_OUTPUT: &str = "\
  Duration: 00:03:20.00, start: 0.000000, bitrate: 129 kb/s\n\
[silencedetect @ 0x1] silence_start: 0\n\
[silencedetect @ 0x1] silence_end: 2.5 | silence_duration: 2.5\n\
[silencedetect @ 0x1] silence_start: 197.0\n";

    #[test]
    fn silence_spans_parsed() {
        let total = parse_media_duration(DETECT_OUTPUT).unwrap();
        assert_eq!(total, 200.0);
        let spans = parse_silence_spans(DETECT_OUTPUT, total);
        assert_eq!(spans, vec![(0.0, 2.5), (197.0, 200.0)]);
    }

    #[test]
    fn trim_bounds_with_padding() {
        let spans = vec![(0.0, 2.5), (197.0, 200.0)];
        let (start, end) = trim_bounds(&spans, 200.0).unwrap();
        assert!((start - 2.0).abs() < 1e-9);
        assert!((end - 197.5).abs() < 1e-9);
    }

    #[test]
    fn short_silence_not_trimmed() {
        // 0.4 s lead + 0.4 s tail: under the 1 s threshold.
        let spans = vec![(0.0, 0.4), (199.6, 200.0)];
        assert!(trim_bounds(&spans, 200.0).is_none());
        assert!(trim_bounds(&[], 200.0).is_none());
    }

    #[test]
    fn loudnorm_json_extracted() {
        let stderr = "frame= 100\n[Parsed_loudnorm_0 @ 0x2]\n{\n\t\"input_i\" : \"-30.0\",\n\t\"input_tp\" : \"-10.2\",\n\t\"input_lra\" : \"5.0\",\n\t\"input_thresh\" : \"-40.2\",\n\t\"target_offset\" : \"0.3\"\n}\n";
        let json = extract_loudnorm_json(stderr).unwrap();
        assert_eq!(json["input_i"].as_str(), Some("-30.0"));
    }
}
