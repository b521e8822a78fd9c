//! Multi-provider lyrics resolution: ordered source search, content
//! cleaning, quality gating, confidence scoring and file output.

pub mod lrclib;
pub mod musixmatch;
pub mod ovh;

use crate::config::LyricsConfig;
use crate::error::Result;
use crate::models::LyricsSource;
use crate::util;
use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

static SECTION_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?im)^\[Verse[^\]]*\]\s*$",
        r"(?im)^\[Chorus[^\]]*\]\s*$",
        r"(?im)^\[Bridge[^\]]*\]\s*$",
        r"(?im)^\[Intro[^\]]*\]\s*$",
        r"(?im)^\[Outro[^\]]*\]\s*$",
        r"(?im)^\[Pre-Chorus[^\]]*\]\s*$",
        r"(?im)^\[Hook[^\]]*\]\s*$",
        r"(?im)^\[Refrain[^\]]*\]\s*$",
        r"(?im)^\[[^\]]*\]\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static LRC_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\d{1,2}):(\d{2})(?:\.(\d{1,3}))?\]").unwrap());

const NO_LYRICS_INDICATORS: &[&str] = &[
    "instrumental",
    "no lyrics",
    "music only",
    "lyrics not available",
    "sorry, no lyrics",
];

const STRUCTURE_INDICATORS: &[&str] = &["verse", "chorus", "bridge", "intro", "outro"];

/// What a provider search ultimately produced for one track.
#[derive(Debug, Clone)]
pub struct ResolvedLyrics {
    pub plain: String,
    pub synced: Option<String>,
    pub source: LyricsSource,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub enum LyricsOutcome {
    Found(ResolvedLyrics),
    Instrumental,
    NotFound,
}

/// One lyrics source. Providers apply their own rate limiting; a provider
/// without credentials reports itself unavailable and is skipped.
#[async_trait]
pub trait LyricsProvider: Send + Sync {
    fn source(&self) -> LyricsSource;

    fn available(&self) -> bool {
        true
    }

    async fn search_lyrics(
        &self,
        artist: &str,
        title: &str,
        album: Option<&str>,
    ) -> Result<Option<String>>;

    async fn search_synced(&self, _artist: &str, _title: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

pub struct LyricsResolver {
    cfg: LyricsConfig,
    providers: Vec<Arc<dyn LyricsProvider>>,
}

impl LyricsResolver {
    pub fn new(client: reqwest::Client, cfg: LyricsConfig) -> Self {
        let providers: Vec<Arc<dyn LyricsProvider>> = vec![
            Arc::new(lrclib::LrclibProvider::new(client.clone())),
            Arc::new(ovh::OvhProvider::new(client.clone())),
            Arc::new(musixmatch::MusixmatchProvider::from_env(client)),
        ];
        Self { cfg, providers }
    }

    /// Test seam: inject custom providers.
    pub fn with_providers(cfg: LyricsConfig, providers: Vec<Arc<dyn LyricsProvider>>) -> Self {
        Self { cfg, providers }
    }

    /// Effective source order: the per-request override (when given) moves
    /// to the front, then primary, then fallbacks; no duplicates; only
    /// sources with an active provider.
    fn search_order(&self, preferred: Option<LyricsSource>) -> Vec<Arc<dyn LyricsProvider>> {
        let mut wanted: Vec<LyricsSource> = Vec::new();
        if let Some(p) = preferred {
            wanted.push(p);
        }
        let primary = LyricsSource::parse(&self.cfg.primary_source);
        if !wanted.contains(&primary) {
            wanted.push(primary);
        }
        for name in &self.cfg.fallback_sources {
            let source = LyricsSource::parse(name);
            if !wanted.contains(&source) {
                wanted.push(source);
            }
        }
        wanted
            .into_iter()
            .filter_map(|source| {
                self.providers
                    .iter()
                    .find(|p| p.source() == source && p.available())
                    .cloned()
            })
            .collect()
    }

    /// Query providers in order until one returns content that survives
    /// cleaning and validation.
    pub async fn search(
        &self,
        artist: &str,
        title: &str,
        album: Option<&str>,
        preferred: Option<LyricsSource>,
    ) -> Result<LyricsOutcome> {
        if !self.cfg.enabled {
            return Ok(LyricsOutcome::NotFound);
        }
        let mut saw_instrumental = false;
        for provider in self.search_order(preferred) {
            let source = provider.source();
            debug!("searching lyrics via {}", source.as_str());
            let raw = match provider.search_lyrics(artist, title, album).await {
                Ok(Some(text)) => text,
                Ok(None) => {
                    debug!("no lyrics from {}", source.as_str());
                    continue;
                }
                Err(e) => {
                    warn!("lyrics search failed via {}: {}", source.as_str(), e);
                    continue;
                }
            };

            if is_instrumental_marker(&raw) {
                debug!("{} reports instrumental", source.as_str());
                saw_instrumental = true;
                continue;
            }

            // Confidence is scored on the raw text so structure markers
            // still count; cleaning strips them for storage.
            let confidence = confidence_score(&raw, title, self.cfg.min_length);
            let plain = if self.cfg.clean_lyrics { clean_lyrics(&raw) } else { raw.clone() };

            if !validate_lyrics(&plain, self.cfg.min_length) {
                debug!("lyrics from {} failed validation", source.as_str());
                continue;
            }

            let synced = match provider.search_synced(artist, title).await {
                Ok(Some(lrc)) if !parse_lrc(&lrc).is_empty() => Some(lrc),
                Ok(_) => None,
                Err(e) => {
                    warn!("synced lyrics fetch failed via {}: {}", source.as_str(), e);
                    None
                }
            };

            return Ok(LyricsOutcome::Found(ResolvedLyrics {
                plain,
                synced,
                source,
                confidence,
            }));
        }
        if saw_instrumental {
            return Ok(LyricsOutcome::Instrumental);
        }
        debug!("no lyrics found from any source for {} - {}", artist, title);
        Ok(LyricsOutcome::NotFound)
    }

    /// Write `.txt` / `.lrc` files next to the audio, backing up existing
    /// same-named files. Returns the created paths, `.txt` first.
    pub fn save_files(
        &self,
        lyrics: &ResolvedLyrics,
        artist: &str,
        title: &str,
        directory: &Path,
        position: Option<u32>,
        max_filename_length: usize,
    ) -> Result<Vec<PathBuf>> {
        if !self.cfg.download_separate_files {
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(directory)?;
        let safe_artist = util::sanitize_filename(artist, max_filename_length, false);
        let safe_title = util::sanitize_filename(title, max_filename_length, false);
        let base = match position {
            Some(pos) => format!("{:02} - {} - {}", pos, safe_artist, safe_title),
            None => format!("{} - {}", safe_artist, safe_title),
        };

        let mut saved = Vec::new();
        if matches!(self.cfg.format.as_str(), "txt" | "both") && !lyrics.plain.is_empty() {
            let path = directory.join(format!("{}.txt", base));
            backup_if_exists(&path);
            std::fs::write(&path, &lyrics.plain)?;
            debug!("saved lyrics: {}", path.display());
            saved.push(path);
        }
        if matches!(self.cfg.format.as_str(), "lrc" | "both") {
            if let Some(synced) = &lyrics.synced {
                let path = directory.join(format!("{}.lrc", base));
                backup_if_exists(&path);
                std::fs::write(&path, synced)?;
                debug!("saved synced lyrics: {}", path.display());
                saved.push(path);
            }
        }
        Ok(saved)
    }

    pub fn embed_enabled(&self) -> bool {
        self.cfg.embed_in_audio
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }
}

fn backup_if_exists(path: &Path) {
    if path.exists() {
        let backup = util::backup_filename(path);
        if let Err(e) = std::fs::rename(path, &backup) {
            warn!("failed to back up {}: {}", path.display(), e);
        } else {
            debug!("created backup: {}", backup.display());
        }
    }
}

/// Strip section markers (`[Verse 1]`, `[Chorus]`, ...) and collapse blank
/// lines.
pub fn clean_lyrics(text: &str) -> String {
    let mut cleaned = text.to_string();
    for re in SECTION_MARKERS.iter() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    cleaned
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Content gate: minimum length, no placeholder phrases, and at least 70%
/// alphanumeric-or-whitespace characters.
pub fn validate_lyrics(text: &str, min_length: usize) -> bool {
    if text.len() < min_length {
        return false;
    }
    let lower = text.to_lowercase();
    if NO_LYRICS_INDICATORS.iter().any(|ind| lower.contains(ind)) {
        return false;
    }
    let text_chars = text.chars().filter(|c| c.is_alphanumeric() || c.is_whitespace()).count();
    let total = text.chars().count();
    total > 0 && (text_chars as f64 / total as f64) >= 0.7
}

/// True when the content itself says there is nothing to sing.
pub fn is_instrumental_marker(text: &str) -> bool {
    let trimmed = text.trim().to_lowercase();
    trimmed.len() < 80
        && (trimmed.contains("instrumental") || trimmed.contains("music only"))
}

/// Confidence in [0, 1]: title-word overlap carries most of the weight,
/// with bonuses for substantial length and structure markers and a penalty
/// for too-short content.
pub fn confidence_score(lyrics: &str, title: &str, min_length: usize) -> f64 {
    if lyrics.is_empty() || title.is_empty() {
        return 0.0;
    }
    let title_words: std::collections::HashSet<String> =
        title.to_lowercase().split_whitespace().map(String::from).collect();
    let lyrics_words: std::collections::HashSet<String> =
        lyrics.to_lowercase().split_whitespace().map(String::from).collect();
    if title_words.is_empty() {
        return 0.0;
    }
    let overlap = title_words.intersection(&lyrics_words).count() as f64 / title_words.len() as f64;

    let mut confidence = overlap * 0.6;
    if lyrics.len() >= min_length * 2 {
        confidence += 0.2;
    }
    let lower = lyrics.to_lowercase();
    if STRUCTURE_INDICATORS.iter().any(|ind| lower.contains(ind)) {
        confidence += 0.1;
    }
    if lyrics.len() < min_length {
        confidence -= 0.3;
    }
    confidence.clamp(0.0, 1.0)
}

/// Parse LRC content into (offset_ms, text) pairs. Lines may carry several
/// leading timestamps; each maps to the same text.
pub fn parse_lrc(content: &str) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let mut rest = line.trim();
        let mut stamps = Vec::new();
        while let Some(caps) = LRC_TAG.captures(rest) {
            let minutes: u64 = caps[1].parse().unwrap_or(0);
            let seconds: u64 = caps[2].parse().unwrap_or(0);
            let frac = caps.get(3).map(|m| m.as_str()).unwrap_or("0");
            let millis = match frac.len() {
                1 => frac.parse::<u64>().unwrap_or(0) * 100,
                2 => frac.parse::<u64>().unwrap_or(0) * 10,
                _ => frac.parse::<u64>().unwrap_or(0),
            };
            stamps.push((minutes * 60 + seconds) * 1000 + millis);
            rest = &rest[caps.get(0).unwrap().end()..];
        }
        let text = rest.trim();
        if !stamps.is_empty() && !text.is_empty() {
            for stamp in stamps {
                out.push((stamp, text.to_string()));
            }
        }
    }
    out.sort_by_key(|(ms, _)| *ms);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning_strips_section_markers() {
        let raw = "[Verse 1]\nfirst line\n\n[Chorus]\nsecond line\n\n\nthird line";
        let cleaned = clean_lyrics(raw);
        assert_eq!(cleaned, "first line\nsecond line\nthird line");
    }

    #[test]
    fn validation_gates() {
        assert!(!validate_lyrics("too short", 50));
        let instrumental = format!("{}\n(instrumental)", "la la la ".repeat(10));
        assert!(!validate_lyrics(&instrumental, 50));
        let noisy = "@#$%^&*".repeat(20);
        assert!(!validate_lyrics(&noisy, 50));
        let good = "these are real lyrics with words ".repeat(5);
        assert!(validate_lyrics(&good, 50));
    }

    #[test]
    fn confidence_scoring() {
        let lyrics = format!(
            "[Verse 1]\nmy wonderful song goes on and on\n{}",
            "and the wonderful song continues with more words here\n".repeat(20)
        );
        let c = confidence_score(&lyrics, "Wonderful Song", 50);
        assert!(c >= 0.8, "confidence was {}", c);
        // Too-short content is penalized.
        let c = confidence_score("song", "Totally Different Name", 50);
        assert!(c <= 0.1);
    }

    #[test]
    fn lrc_parsing() {
        let lrc = "[00:12.50]first line\n[00:45.1]second line\n[01:02]third\nnot a tag";
        let parsed = parse_lrc(lrc);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], (12_500, "first line".to_string()));
        assert_eq!(parsed[1], (45_100, "second line".to_string()));
        assert_eq!(parsed[2], (62_000, "third".to_string()));
    }

    #[test]
    fn lrc_multiple_stamps_per_line() {
        let lrc = "[00:10.00][00:50.00]repeated hook";
        let parsed = parse_lrc(lrc);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, 10_000);
        assert_eq!(parsed[1].0, 50_000);
        assert_eq!(parsed[0].1, "repeated hook");
    }

    #[test]
    fn instrumental_marker() {
        assert!(is_instrumental_marker("[Instrumental]"));
        assert!(!is_instrumental_marker(
            &"long real lyrics that happen to mention an instrumental bridge somewhere ".repeat(3)
        ));
    }
}
