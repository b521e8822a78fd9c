use crate::error::Result;
use crate::http::Throttle;
use crate::lyrics::LyricsProvider;
use crate::models::LyricsSource;
use async_trait::async_trait;
use serde_json::Value;
use std::env;
use std::time::Duration;

/// musixmatch: requires an API key (MUSIXMATCH_API_KEY). Without one the
/// provider reports itself unavailable and the resolver skips it.
pub struct MusixmatchProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    throttle: Throttle,
}

impl MusixmatchProvider {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key: api_key.filter(|k| !k.is_empty()),
            throttle: Throttle::new(Duration::from_secs(1)),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Self {
        Self::new(client, env::var("MUSIXMATCH_API_KEY").ok())
    }

    fn api_base() -> String {
        env::var("MUSIXMATCH_API_BASE").unwrap_or_else(|_| "https://api.musixmatch.com".into())
    }
}

#[async_trait]
impl LyricsProvider for MusixmatchProvider {
    fn source(&self) -> LyricsSource {
        LyricsSource::Musixmatch
    }

    fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search_lyrics(
        &self,
        artist: &str,
        title: &str,
        _album: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(api_key) = &self.api_key else {
            return Ok(None);
        };
        self.throttle.wait().await;
        let url = format!(
            "{}/ws/1.1/matcher.lyrics.get?q_track={}&q_artist={}&apikey={}",
            Self::api_base(),
            urlencoding::encode(title),
            urlencoding::encode(artist),
            urlencoding::encode(api_key)
        );
        let resp = self.client.get(&url).send().await?;
        let json: Value = resp.error_for_status()?.json().await?;

        let status = json["message"]["header"]["status_code"].as_i64().unwrap_or(0);
        if status == 404 {
            return Ok(None);
        }
        let body = json["message"]["body"]["lyrics"]["lyrics_body"]
            .as_str()
            .unwrap_or("");
        // The API appends a "This Lyrics is NOT for Commercial use" banner
        // after a row of asterisks.
        let cleaned = body.split("*******").next().unwrap_or("").trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        Ok(Some(cleaned.to_string()))
    }
}
