use crate::api::auth::Auth;
use crate::error::{Result, SyncError};
use crate::http::{retry_after_secs, Throttle};
use crate::models::{Album, AlbumImage, Artist, Playlist, PlaylistTrack, Track};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use std::env;
use std::sync::Arc;
use std::time::Duration;

static RAW_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{22}$").unwrap());
static URL_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/playlist/([A-Za-z0-9]+)").unwrap());
static URI_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*:playlist:([A-Za-z0-9]+)$").unwrap());

const PAGE_SIZE: usize = 100;
const BATCH_SIZE: usize = 50;

/// Client for the source catalog (the platform that owns the playlist).
/// Endpoints may be overridden by SOURCE_API_BASE / SOURCE_AUTH_BASE env
/// vars (useful for tests). A shared throttle keeps at least 100 ms between
/// outbound requests.
pub struct SourceClient {
    client: reqwest::Client,
    auth: Arc<Auth>,
    throttle: Throttle,
}

impl SourceClient {
    pub fn new(client: reqwest::Client, auth: Arc<Auth>) -> Self {
        Self {
            client,
            auth,
            throttle: Throttle::new(Duration::from_millis(100)),
        }
    }

    fn api_base() -> String {
        env::var("SOURCE_API_BASE").unwrap_or_else(|_| "https://api.spotify.com/v1".into())
    }

    /// Accepts a raw 22-char id, a `/playlist/<id>` URL, or a
    /// `<scheme>:playlist:<id>` URI. Anything else is rejected with a
    /// message naming the defect.
    pub fn extract_playlist_id(reference: &str) -> Result<String> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SyncError::Config("playlist reference is empty".into()));
        }
        if RAW_ID.is_match(reference) {
            return Ok(reference.to_string());
        }
        if reference.contains("/playlist/") {
            let id = URL_ID
                .captures(reference)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            if RAW_ID.is_match(&id) {
                return Ok(id);
            }
            return Err(SyncError::Config(
                "playlist URL does not contain a 22-character alphanumeric id".into(),
            ));
        }
        if reference.contains(":playlist:") {
            let id = URI_ID
                .captures(reference)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            if RAW_ID.is_match(&id) {
                return Ok(id);
            }
            return Err(SyncError::Config(
                "playlist URI does not match <scheme>:playlist:<22-char id>".into(),
            ));
        }
        Err(SyncError::Config(format!(
            "not a playlist reference: {} (expected a 22-character id, a /playlist/ URL, or a <scheme>:playlist:<id> URI)",
            reference
        )))
    }

    /// Rate-limited GET with bearer auth. Refreshes the token once on 401;
    /// honors Retry-After on 429; classifies 5xx as transient and 403/404 as
    /// permanent failures.
    async fn get_json(&self, url: &str) -> Result<Value> {
        let mut refreshed = false;
        let mut rate_limit_hits = 0u32;
        loop {
            self.throttle.wait().await;
            let bearer = self.auth.bearer().await?;
            let resp = self
                .client
                .get(url)
                .header(AUTHORIZATION, &bearer)
                .send()
                .await?;
            let status = resp.status();

            if status.as_u16() == 401 {
                if refreshed {
                    return Err(SyncError::Auth("unauthorized after token refresh".into()));
                }
                debug!("got 401 from source catalog; refreshing token once");
                refreshed = true;
                self.auth.refresh_and_bearer().await?;
                continue;
            }
            if status.as_u16() == 429 {
                let wait = retry_after_secs(&resp).unwrap_or(2);
                rate_limit_hits += 1;
                if rate_limit_hits > 3 {
                    return Err(SyncError::source_transient(format!(
                        "still rate limited after {} waits",
                        rate_limit_hits - 1
                    )));
                }
                warn!("source catalog rate limited, waiting {}s", wait);
                tokio::time::sleep(Duration::from_secs(wait + 1)).await;
                continue;
            }
            if status.is_server_error() {
                return Err(SyncError::source_transient(format!("server error: {}", status)));
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(SyncError::source_permanent(format!("{} => {}", status, body)));
            }
            return Ok(resp.json().await?);
        }
    }

    /// Fetch playlist header without tracks.
    pub async fn get_playlist_info(&self, playlist_id: &str) -> Result<Playlist> {
        let url = format!(
            "{}/playlists/{}?fields=id,name,description,owner,public,collaborative,tracks(total),snapshot_id",
            Self::api_base(),
            playlist_id
        );
        let json = self.get_json(&url).await?;
        parse_playlist_header(&json)
    }

    /// Fetch all tracks in playlist order via paginated requests. Null
    /// tracks (removed items) are skipped with a warning; positions still
    /// advance past them.
    pub async fn get_playlist_tracks(&self, playlist_id: &str) -> Result<Vec<PlaylistTrack>> {
        let mut tracks = Vec::new();
        let mut offset = 0usize;
        let mut position = 1u32;
        loop {
            let url = format!(
                "{}/playlists/{}/tracks?offset={}&limit={}&fields=items(added_at,track(id,name,artists,album,duration_ms,explicit,track_number,disc_number,external_ids,is_playable)),next,total",
                Self::api_base(),
                playlist_id,
                offset,
                PAGE_SIZE
            );
            let json = self.get_json(&url).await?;
            let items = json["items"].as_array().cloned().unwrap_or_default();
            if items.is_empty() {
                break;
            }
            for item in &items {
                let track_value = &item["track"];
                if track_value.is_null() || track_value["id"].as_str().is_none() {
                    warn!("skipping unavailable track at position {}", position);
                    position += 1;
                    continue;
                }
                match parse_track(track_value) {
                    Some(track) => {
                        let added_at = item["added_at"]
                            .as_str()
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|dt| dt.with_timezone(&Utc));
                        tracks.push(PlaylistTrack::new(track, position, added_at));
                    }
                    None => warn!("failed to parse track at position {}", position),
                }
                position += 1;
            }
            if json["next"].as_str().is_none() {
                break;
            }
            offset += PAGE_SIZE;
            if offset % 500 == 0 {
                debug!("fetched {} playlist items...", offset);
            }
        }
        Ok(tracks)
    }

    /// Complete playlist with all tracks.
    pub async fn get_full_playlist(&self, playlist_id: &str) -> Result<Playlist> {
        let mut playlist = self.get_playlist_info(playlist_id).await?;
        playlist.tracks = self.get_playlist_tracks(playlist_id).await?;
        debug!("loaded playlist '{}' with {} tracks", playlist.name, playlist.tracks.len());
        Ok(playlist)
    }

    /// Batch-resolve up to 50 track ids. Unavailable ids come back as None.
    pub async fn get_tracks(&self, track_ids: &[String]) -> Result<Vec<Option<Track>>> {
        if track_ids.len() > BATCH_SIZE {
            return Err(SyncError::source_permanent(format!(
                "at most {} track ids per request",
                BATCH_SIZE
            )));
        }
        if track_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/tracks?ids={}", Self::api_base(), track_ids.join(","));
        let json = self.get_json(&url).await?;
        let tracks = json["tracks"]
            .as_array()
            .map(|arr| arr.iter().map(parse_track).collect())
            .unwrap_or_default();
        Ok(tracks)
    }

    /// True when the playlist is reachable with the current credential.
    pub async fn validate_playlist_access(&self, playlist_id: &str) -> bool {
        let url = format!("{}/playlists/{}?fields=id", Self::api_base(), playlist_id);
        match self.get_json(&url).await {
            Ok(_) => true,
            Err(e) => {
                warn!("playlist {} not accessible: {}", playlist_id, e);
                false
            }
        }
    }
}

fn parse_playlist_header(json: &Value) -> Result<Playlist> {
    let id = json["id"]
        .as_str()
        .ok_or_else(|| SyncError::source_permanent("playlist response missing id"))?
        .to_string();
    let name = json["name"].as_str().unwrap_or("Unknown Playlist").to_string();
    let owner = json["owner"]["display_name"]
        .as_str()
        .or_else(|| json["owner"]["id"].as_str())
        .unwrap_or("")
        .to_string();
    Ok(Playlist {
        id,
        name,
        description: json["description"].as_str().unwrap_or("").to_string(),
        owner,
        public: json["public"].as_bool(),
        collaborative: json["collaborative"].as_bool(),
        snapshot_id: json["snapshot_id"].as_str().map(|s| s.to_string()),
        total_tracks: json["tracks"]["total"].as_u64().unwrap_or(0) as u32,
        tracks: Vec::new(),
    })
}

pub(crate) fn parse_track(json: &Value) -> Option<Track> {
    let id = json["id"].as_str()?.to_string();
    let title = json["name"].as_str()?.to_string();
    let artists = json["artists"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|a| {
                    Some(Artist {
                        id: a["id"].as_str().unwrap_or("").to_string(),
                        name: a["name"].as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let album_value = &json["album"];
    let album = Album {
        id: album_value["id"].as_str().unwrap_or("").to_string(),
        name: album_value["name"].as_str().unwrap_or("").to_string(),
        artists: album_value["artists"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|a| {
                        Some(Artist {
                            id: a["id"].as_str().unwrap_or("").to_string(),
                            name: a["name"].as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        release_date: album_value["release_date"].as_str().unwrap_or("").to_string(),
        release_date_precision: album_value["release_date_precision"]
            .as_str()
            .unwrap_or("day")
            .to_string(),
        images: album_value["images"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|img| {
                        Some(AlbumImage {
                            url: img["url"].as_str()?.to_string(),
                            width: img["width"].as_u64().unwrap_or(0) as u32,
                            height: img["height"].as_u64().unwrap_or(0) as u32,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        genres: album_value["genres"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|g| g.as_str().map(String::from)).collect())
            .unwrap_or_default(),
    };
    Some(Track {
        id,
        title,
        artists,
        album,
        duration_ms: json["duration_ms"].as_u64().unwrap_or(0),
        explicit: json["explicit"].as_bool().unwrap_or(false),
        track_number: json["track_number"].as_u64().unwrap_or(0) as u32,
        disc_number: json["disc_number"].as_u64().unwrap_or(1) as u32,
        isrc: json["external_ids"]["isrc"].as_str().map(|s| s.to_string()),
        is_playable: json["is_playable"].as_bool().unwrap_or(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_shapes_accepted() {
        let id = "a".repeat(22);
        assert_eq!(SourceClient::extract_playlist_id(&id).unwrap(), id);
        let url = format!("https://open.example.com/playlist/{}?si=xyz", id);
        assert_eq!(SourceClient::extract_playlist_id(&url).unwrap(), id);
        let uri = format!("spotify:playlist:{}", id);
        assert_eq!(SourceClient::extract_playlist_id(&uri).unwrap(), id);
    }

    #[test]
    fn bad_references_rejected_with_reason() {
        for bad in ["", "tooshort", "https://open.example.com/album/abc", "scheme:playlist:short"] {
            let err = SourceClient::extract_playlist_id(bad).unwrap_err();
            assert!(matches!(err, SyncError::Config(_)), "expected validation error for {:?}", bad);
        }
    }

    #[test]
    fn parse_track_minimal() {
        let json: Value = serde_json::json!({
            "id": "t1",
            "name": "Song",
            "artists": [{"id": "a1", "name": "Artist"}],
            "album": {
                "id": "al1", "name": "Album",
                "release_date": "2021-03-01", "release_date_precision": "day",
                "images": [{"url": "http://img", "width": 640, "height": 640}]
            },
            "duration_ms": 200000,
            "explicit": false,
            "track_number": 3,
            "external_ids": {"isrc": "USX123"}
        });
        let track = parse_track(&json).unwrap();
        assert_eq!(track.id, "t1");
        assert_eq!(track.primary_artist(), "Artist");
        assert_eq!(track.duration_secs(), 200);
        assert_eq!(track.disc_number, 1);
        assert_eq!(track.isrc.as_deref(), Some("USX123"));
    }
}
