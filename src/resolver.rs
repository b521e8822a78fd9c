//! Track resolver: converts (artist, title, duration, album) into at most
//! one downloadable candidate on the secondary catalog, using a multi-query
//! strategy with weighted scoring and a strict -> permissive cascade.

use crate::api::ytm::{Candidate, YtmClient};
use crate::config::MatchingConfig;
use crate::error::Result;
use crate::util;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

pub const STRICT_THRESHOLD: f64 = 65.0;
pub const PERMISSIVE_THRESHOLD: f64 = 45.0;
const EARLY_EXIT_SCORE: f64 = 85.0;
const EARLY_EXIT_COUNT: usize = 3;
/// Below this artist similarity, featured artists are tried as a fallback.
const FEATURED_ARTIST_SIM_PIVOT: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateScore {
    pub title_score: f64,
    pub artist_score: f64,
    pub duration_score: f64,
    pub quality_bonus: f64,
}

impl CandidateScore {
    pub fn total(&self) -> f64 {
        self.title_score + self.artist_score + self.duration_score + self.quality_bonus
    }
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: CandidateScore,
}

impl ScoredCandidate {
    pub fn total(&self) -> f64 {
        self.score.total()
    }
}

/// Weighted score for one candidate against the target track.
///
/// title 0-40, artist 0-30, duration 0-20, quality -10..+10; total <= 110.
pub fn score_candidate(
    candidate: &Candidate,
    target_artist: &str,
    target_title: &str,
    target_duration_s: Option<u64>,
    cfg: &MatchingConfig,
) -> CandidateScore {
    let norm_target_artist = util::normalize_artist_name(target_artist);
    let norm_target_title = util::normalize_track_title(target_title);
    let norm_cand_artist = util::normalize_artist_name(&candidate.artist);
    let norm_cand_title = util::normalize_track_title(&candidate.title);

    let title_score = 40.0 * util::similarity(&norm_target_title, &norm_cand_title);

    let mut artist_sim = util::similarity(&norm_target_artist, &norm_cand_artist);
    if artist_sim < FEATURED_ARTIST_SIM_PIVOT && !candidate.featured_artists.is_empty() {
        let best_featured = candidate
            .featured_artists
            .iter()
            .map(|name| util::similarity(&norm_target_artist, &util::normalize_artist_name(name)))
            .fold(0.0_f64, f64::max);
        if best_featured > artist_sim {
            artist_sim = best_featured;
        }
    }
    let artist_score = 30.0 * artist_sim;

    let duration_score = match (target_duration_s, candidate.duration_s) {
        (Some(target), Some(actual)) => {
            let tolerance = cfg.duration_tolerance as f64;
            let diff = (target as f64 - actual as f64).abs();
            if diff <= tolerance {
                20.0
            } else if diff <= tolerance * 3.0 {
                let penalty = (diff - tolerance) / (tolerance * 2.0);
                20.0 * (1.0 - penalty)
            } else {
                0.0
            }
        }
        _ => 10.0,
    };

    let mut quality_bonus: f64 = 0.0;
    if candidate.is_official {
        quality_bonus += 5.0;
    }
    if candidate.is_verified_artist {
        quality_bonus += 2.0;
    }
    if candidate.is_music_video && cfg.prefer_official {
        quality_bonus -= 1.0;
    }
    if candidate.is_live && cfg.exclude_live {
        quality_bonus -= 8.0;
    }
    if candidate.is_cover && cfg.exclude_covers {
        quality_bonus -= 6.0;
    }
    if candidate.is_karaoke {
        quality_bonus -= 10.0;
    }
    if candidate.is_remix {
        quality_bonus -= 3.0;
    }
    quality_bonus = quality_bonus.clamp(-10.0, 10.0);

    CandidateScore { title_score, artist_score, duration_score, quality_bonus }
}

/// Ordered, deduplicated query list for one phase of the cascade.
pub fn build_queries(
    artist: &str,
    title: &str,
    album: Option<&str>,
    prefer_official: bool,
    permissive: bool,
) -> Vec<String> {
    let norm_artist = util::normalize_artist_name(artist);
    let norm_title = util::normalize_track_title(title);

    let mut queries = Vec::new();
    queries.push(format!("{} {}", norm_artist, norm_title));
    if prefer_official {
        queries.push(format!("{} {} official audio", norm_artist, norm_title));
    }
    // Album context helps disambiguate common titles.
    if let Some(album) = album {
        if !title.to_lowercase().contains(&album.to_lowercase()) {
            queries.insert(1, format!("{} {} {}", norm_artist, norm_title, album));
        }
    }
    queries.push(format!("{} {}", artist.trim(), title.trim()));
    queries.push(norm_title.clone());
    queries.push(title.trim().to_string());
    if util::has_feat_credit(artist) {
        queries.push(format!("{} {}", util::strip_feat(&norm_artist), norm_title));
    }
    if permissive {
        queries.push(format!("{}{}", artist.trim(), title.trim()));
        if norm_title.split_whitespace().count() > 1 {
            queries.push(format!("\"{}\"", norm_title));
        }
    }

    let mut seen = HashSet::new();
    queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && seen.insert(q.clone()))
        .collect()
}

pub struct TrackResolver {
    ytm: Arc<YtmClient>,
    cfg: MatchingConfig,
}

impl TrackResolver {
    pub fn new(ytm: Arc<YtmClient>, cfg: MatchingConfig) -> Self {
        Self { ytm, cfg }
    }

    /// Best candidate for the target, or None when both phases come up dry.
    pub async fn resolve(
        &self,
        artist: &str,
        title: &str,
        duration_s: Option<u64>,
        album: Option<&str>,
    ) -> Result<Option<ScoredCandidate>> {
        let results = self.search(artist, title, duration_s, album).await?;
        Ok(results.into_iter().next())
    }

    /// Strict phase first; the permissive phase only runs when strict found
    /// nothing at all. Results are sorted best-first.
    pub async fn search(
        &self,
        artist: &str,
        title: &str,
        duration_s: Option<u64>,
        album: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>> {
        let strict = self
            .search_phase(artist, title, duration_s, album, STRICT_THRESHOLD, false)
            .await?;
        if !strict.is_empty() {
            debug!("strict search matched: {} - {}", artist, title);
            return Ok(strict);
        }
        debug!("strict search empty, trying permissive for: {} - {}", artist, title);
        let permissive = self
            .search_phase(artist, title, duration_s, album, PERMISSIVE_THRESHOLD, true)
            .await?;
        if permissive.is_empty() {
            debug!("both phases empty for: {} - {}", artist, title);
        }
        Ok(permissive)
    }

    async fn search_phase(
        &self,
        artist: &str,
        title: &str,
        duration_s: Option<u64>,
        album: Option<&str>,
        threshold: f64,
        permissive: bool,
    ) -> Result<Vec<ScoredCandidate>> {
        let queries = build_queries(artist, title, album, self.cfg.prefer_official, permissive);
        let mut results: Vec<ScoredCandidate> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();

        for (i, query) in queries.iter().enumerate() {
            debug!(
                "search attempt {}/{} (threshold={}): '{}'",
                i + 1,
                queries.len(),
                threshold,
                query
            );
            let candidates = match self.ytm.search_songs(query, self.cfg.max_results).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("search query '{}' failed: {}", query, e);
                    continue;
                }
            };
            for candidate in candidates {
                if !seen_ids.insert(candidate.video_id.clone()) {
                    continue;
                }
                let score = score_candidate(&candidate, artist, title, duration_s, &self.cfg);
                if score.total() >= threshold {
                    debug!(
                        "candidate: {} - {} ({:.1})",
                        candidate.artist,
                        candidate.title,
                        score.total()
                    );
                    results.push(ScoredCandidate { candidate, score });
                }
            }
            // Strict phase stops once enough high-confidence matches exist.
            if !permissive {
                let high = results.iter().filter(|r| r.total() >= EARLY_EXIT_SCORE).count();
                if high >= EARLY_EXIT_COUNT {
                    debug!("found {} high-confidence matches, stopping early", high);
                    break;
                }
            }
        }

        results.sort_by(|a, b| {
            b.total().partial_cmp(&a.total()).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MatchingConfig {
        toml::from_str("").unwrap()
    }

    fn candidate(title: &str, artist: &str, duration: Option<u64>) -> Candidate {
        let mut c = Candidate {
            video_id: "v".into(),
            title: title.into(),
            artist: artist.into(),
            featured_artists: vec![],
            duration_s: duration,
            album: None,
            thumbnail: None,
            is_official: false,
            is_verified_artist: false,
            is_music_video: false,
            is_live: false,
            is_cover: false,
            is_karaoke: false,
            is_remix: false,
        };
        // Re-run the client-side title classification for realism.
        let lower = c.title.to_lowercase();
        c.is_live = lower.contains("live");
        c.is_official = lower.contains("official audio");
        c.is_karaoke = lower.contains("karaoke");
        c
    }

    #[test]
    fn perfect_match_scores_ninety() {
        let c = candidate("My Song", "My Artist", Some(200));
        let s = score_candidate(&c, "My Artist", "My Song", Some(200), &cfg());
        assert_eq!(s.title_score, 40.0);
        assert_eq!(s.artist_score, 30.0);
        assert_eq!(s.duration_score, 20.0);
        assert_eq!(s.quality_bonus, 0.0);
        assert_eq!(s.total(), 90.0);
    }

    #[test]
    fn duration_tiers() {
        let cfg = cfg();
        // Within tolerance (15 s default).
        let c = candidate("T", "A", Some(210));
        assert_eq!(score_candidate(&c, "A", "T", Some(200), &cfg).duration_score, 20.0);
        // Between tau and 3*tau: linear falloff. diff=30 -> 20 * (1 - 15/30) = 10.
        let c = candidate("T", "A", Some(230));
        let s = score_candidate(&c, "A", "T", Some(200), &cfg);
        assert!((s.duration_score - 10.0).abs() < 1e-9);
        // Beyond 3*tau: zero.
        let c = candidate("T", "A", Some(300));
        assert_eq!(score_candidate(&c, "A", "T", Some(200), &cfg).duration_score, 0.0);
        // Unknown target duration: neutral 10.
        let c = candidate("T", "A", Some(200));
        assert_eq!(score_candidate(&c, "A", "T", None, &cfg).duration_score, 10.0);
    }

    #[test]
    fn quality_bonus_clamped() {
        let mut c = candidate("T (Karaoke Live)", "A", Some(200));
        c.is_live = true;
        c.is_karaoke = true;
        c.is_cover = true;
        let s = score_candidate(&c, "A", "T", Some(200), &cfg());
        assert_eq!(s.quality_bonus, -10.0);
    }

    #[test]
    fn featured_artist_fallback() {
        let mut c = candidate("Song", "Some Band", Some(200));
        c.featured_artists = vec!["Target Artist".into()];
        let s = score_candidate(&c, "Target Artist", "Song", Some(200), &cfg());
        // Primary artist barely matches; the featured credit carries it.
        assert_eq!(s.artist_score, 30.0);
    }

    #[test]
    fn score_monotonic_in_title_similarity() {
        let cfg = cfg();
        let close = candidate("My Song", "A", Some(200));
        let far = candidate("Completely Different", "A", Some(200));
        let s_close = score_candidate(&close, "A", "My Song", Some(200), &cfg);
        let s_far = score_candidate(&far, "A", "My Song", Some(200), &cfg);
        assert!(s_close.title_score > s_far.title_score);
        assert!(s_close.total() > s_far.total());
    }

    #[test]
    fn queries_ordered_and_deduped() {
        let queries = build_queries("The Artist", "Song (Remix)", None, true, false);
        assert_eq!(queries[0], "artist song");
        assert!(queries.contains(&"The Artist Song (Remix)".to_string()));
        assert!(queries.contains(&"song".to_string()));
        let unique: HashSet<&String> = queries.iter().collect();
        assert_eq!(unique.len(), queries.len());
    }

    #[test]
    fn permissive_adds_quoted_exact_title() {
        let queries = build_queries("Artist", "Two Words", None, false, true);
        assert!(queries.contains(&"\"two words\"".to_string()));
        let strict = build_queries("Artist", "Two Words", None, false, false);
        assert!(!strict.contains(&"\"two words\"".to_string()));
    }

    #[test]
    fn feat_variant_query_present() {
        let queries = build_queries("Artist feat. Guest", "Song", None, false, false);
        assert!(queries.iter().any(|q| q == "artist song"));
    }
}
