use crate::error::Result;
use crate::http::Throttle;
use crate::util;
use log::debug;
use serde_json::Value;
use std::env;
use std::time::Duration;

const OFFICIAL_INDICATORS: &[&str] = &[
    "official audio",
    "official video",
    "official music video",
    "provided to youtube",
    "auto-generated",
];

/// One search result from the secondary catalog.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub video_id: String,
    pub title: String,
    /// Primary artist name.
    pub artist: String,
    /// Remaining credited artists, used for featured-artist matching.
    pub featured_artists: Vec<String>,
    pub duration_s: Option<u64>,
    pub album: Option<String>,
    pub thumbnail: Option<String>,

    pub is_official: bool,
    pub is_verified_artist: bool,
    pub is_music_video: bool,
    pub is_live: bool,
    pub is_cover: bool,
    pub is_karaoke: bool,
    pub is_remix: bool,
}

/// Song-search client for the secondary catalog (where audio is actually
/// fetched from). The endpoint is overridable via YTM_API_BASE for tests; a
/// shared throttle keeps at least 1 s between searches.
pub struct YtmClient {
    client: reqwest::Client,
    throttle: Throttle,
}

impl YtmClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            throttle: Throttle::new(Duration::from_secs(1)),
        }
    }

    fn api_base() -> String {
        env::var("YTM_API_BASE").unwrap_or_else(|_| "https://music.youtube.com/api/v1".into())
    }

    /// Search songs. Results without a video id are dropped.
    pub async fn search_songs(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        self.throttle.wait().await;
        let url = format!(
            "{}/search?q={}&filter=songs&limit={}",
            Self::api_base(),
            urlencoding::encode(query),
            limit
        );
        let resp = self.client.get(&url).send().await?;
        let json: Value = resp.error_for_status()?.json().await?;
        let results = json["results"].as_array().cloned().unwrap_or_default();
        debug!("search '{}' returned {} results", query, results.len());
        Ok(results.iter().filter_map(parse_candidate).collect())
    }
}

fn parse_candidate(json: &Value) -> Option<Candidate> {
    let video_id = json["videoId"].as_str()?.to_string();
    let title = json["title"].as_str().unwrap_or("").to_string();

    let artists = json["artists"].as_array().cloned().unwrap_or_default();
    let artist = artists
        .first()
        .and_then(|a| a["name"].as_str())
        .unwrap_or("Unknown Artist")
        .to_string();
    let featured_artists: Vec<String> = artists
        .iter()
        .skip(1)
        .filter_map(|a| a["name"].as_str().map(String::from))
        .collect();
    // A stable channel id on the primary artist entry is the best signal
    // the catalog gives us for a verified artist.
    let is_verified_artist = artists
        .first()
        .and_then(|a| a["id"].as_str())
        .map(|id| !id.is_empty())
        .unwrap_or(false);

    let duration_s = json["duration_seconds"]
        .as_u64()
        .or_else(|| json["duration"].as_str().and_then(util::parse_duration_str));

    let album = json["album"]["name"].as_str().map(String::from);
    let thumbnail = json["thumbnails"]
        .as_array()
        .and_then(|arr| arr.last())
        .and_then(|t| t["url"].as_str())
        .map(String::from);

    let mut candidate = Candidate {
        video_id,
        title,
        artist,
        featured_artists,
        duration_s,
        album,
        thumbnail,
        is_official: false,
        is_verified_artist,
        is_music_video: false,
        is_live: false,
        is_cover: false,
        is_karaoke: false,
        is_remix: false,
    };
    analyze_flags(&mut candidate);
    Some(candidate)
}

/// Substring classification of the candidate title into content flags.
fn analyze_flags(candidate: &mut Candidate) {
    let title = candidate.title.to_lowercase();

    candidate.is_official = OFFICIAL_INDICATORS.iter().any(|ind| title.contains(ind));
    candidate.is_music_video =
        title.contains("music video") || title.contains("official video");
    candidate.is_live =
        title.contains("live") || title.contains("concert") || title.contains("tour");
    candidate.is_cover = title.contains("cover");
    candidate.is_karaoke = title.contains("karaoke") || title.contains("instrumental");
    candidate.is_remix =
        title.contains("remix") || title.contains("extended") || title.contains("mashup");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_flags_from_title() {
        let json: Value = serde_json::json!({
            "videoId": "v1",
            "title": "Song (Live at the Arena)",
            "artists": [{"name": "Artist", "id": "UC123"}, {"name": "Guest"}],
            "duration": "3:21"
        });
        let c = parse_candidate(&json).unwrap();
        assert!(c.is_live);
        assert!(c.is_verified_artist);
        assert_eq!(c.featured_artists, vec!["Guest".to_string()]);
        assert_eq!(c.duration_s, Some(201));
    }

    #[test]
    fn candidate_official_detection() {
        let json: Value = serde_json::json!({
            "videoId": "v2",
            "title": "Song (Official Audio)",
            "artists": [{"name": "Artist"}],
            "duration_seconds": 180
        });
        let c = parse_candidate(&json).unwrap();
        assert!(c.is_official);
        assert!(!c.is_verified_artist);
        assert_eq!(c.duration_s, Some(180));
    }

    #[test]
    fn candidate_without_video_id_dropped() {
        let json: Value = serde_json::json!({"title": "No id"});
        assert!(parse_candidate(&json).is_none());
    }
}
