use crate::error::Result;
use crate::http::Throttle;
use crate::lyrics::LyricsProvider;
use crate::models::LyricsSource;
use async_trait::async_trait;
use serde_json::Value;
use std::env;
use std::time::Duration;

/// lyrics.ovh: credential-free plain-text source, used as a fallback.
pub struct OvhProvider {
    client: reqwest::Client,
    throttle: Throttle,
}

impl OvhProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            throttle: Throttle::new(Duration::from_secs(1)),
        }
    }

    fn api_base() -> String {
        env::var("LYRICS_OVH_API_BASE").unwrap_or_else(|_| "https://api.lyrics.ovh".into())
    }
}

#[async_trait]
impl LyricsProvider for OvhProvider {
    fn source(&self) -> LyricsSource {
        LyricsSource::Ovh
    }

    async fn search_lyrics(
        &self,
        artist: &str,
        title: &str,
        _album: Option<&str>,
    ) -> Result<Option<String>> {
        self.throttle.wait().await;
        let url = format!(
            "{}/v1/{}/{}",
            Self::api_base(),
            urlencoding::encode(artist),
            urlencoding::encode(title)
        );
        let resp = self.client.get(&url).send().await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let json: Value = resp.error_for_status()?.json().await?;
        Ok(json["lyrics"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from))
    }
}
