use crate::error::Result;
use crate::http::Throttle;
use crate::lyrics::LyricsProvider;
use crate::models::LyricsSource;
use async_trait::async_trait;
use serde_json::Value;
use std::env;
use std::time::Duration;

/// lrclib.net: open JSON API, no credentials, serves both plain and
/// synchronized lyrics.
pub struct LrclibProvider {
    client: reqwest::Client,
    throttle: Throttle,
}

impl LrclibProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            throttle: Throttle::new(Duration::from_secs(1)),
        }
    }

    fn api_base() -> String {
        env::var("LRCLIB_API_BASE").unwrap_or_else(|_| "https://lrclib.net/api".into())
    }

    async fn get_record(
        &self,
        artist: &str,
        title: &str,
        album: Option<&str>,
    ) -> Result<Option<Value>> {
        self.throttle.wait().await;
        let mut url = format!(
            "{}/get?artist_name={}&track_name={}",
            Self::api_base(),
            urlencoding::encode(artist),
            urlencoding::encode(title)
        );
        if let Some(album) = album {
            url.push_str(&format!("&album_name={}", urlencoding::encode(album)));
        }
        let resp = self.client.get(&url).send().await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let json: Value = resp.error_for_status()?.json().await?;
        Ok(Some(json))
    }
}

#[async_trait]
impl LyricsProvider for LrclibProvider {
    fn source(&self) -> LyricsSource {
        LyricsSource::Lrclib
    }

    async fn search_lyrics(
        &self,
        artist: &str,
        title: &str,
        album: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(record) = self.get_record(artist, title, album).await? else {
            return Ok(None);
        };
        if record["instrumental"].as_bool().unwrap_or(false) {
            // Signal the pipeline through the content gate.
            return Ok(Some("[Instrumental]".into()));
        }
        Ok(record["plainLyrics"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from))
    }

    async fn search_synced(&self, artist: &str, title: &str) -> Result<Option<String>> {
        let Some(record) = self.get_record(artist, title, None).await? else {
            return Ok(None);
        };
        Ok(record["syncedLyrics"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from))
    }
}
