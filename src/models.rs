use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioStatus {
    Pending,
    Downloading,
    Downloaded,
    Failed,
    Skipped,
}

impl AudioStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            AudioStatus::Downloaded => "✅",
            AudioStatus::Pending => "⏳",
            AudioStatus::Failed => "❌",
            AudioStatus::Skipped => "⏭️",
            AudioStatus::Downloading => "⬇️",
        }
    }

    pub fn from_icon(icon: &str) -> Option<Self> {
        match icon {
            "✅" => Some(AudioStatus::Downloaded),
            "⏳" => Some(AudioStatus::Pending),
            "❌" => Some(AudioStatus::Failed),
            "⏭️" => Some(AudioStatus::Skipped),
            "⬇️" => Some(AudioStatus::Downloading),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LyricsStatus {
    Pending,
    Downloading,
    Downloaded,
    Failed,
    NotFound,
    Instrumental,
    Skipped,
}

impl LyricsStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            LyricsStatus::Downloaded => "🎵",
            LyricsStatus::NotFound => "🚫",
            LyricsStatus::Instrumental => "🎼",
            LyricsStatus::Pending => "⏳",
            LyricsStatus::Failed => "❌",
            LyricsStatus::Skipped => "⏭️",
            LyricsStatus::Downloading => "⬇️",
        }
    }

    pub fn from_icon(icon: &str) -> Option<Self> {
        match icon {
            "🎵" => Some(LyricsStatus::Downloaded),
            "🚫" => Some(LyricsStatus::NotFound),
            "🎼" => Some(LyricsStatus::Instrumental),
            "⏳" => Some(LyricsStatus::Pending),
            "❌" => Some(LyricsStatus::Failed),
            "⏭️" => Some(LyricsStatus::Skipped),
            "⬇️" => Some(LyricsStatus::Downloading),
            _ => None,
        }
    }
}

/// Lyrics provider identity recorded on a track and in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LyricsSource {
    Lrclib,
    Ovh,
    Musixmatch,
    Unknown,
}

impl LyricsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LyricsSource::Lrclib => "lrclib",
            LyricsSource::Ovh => "ovh",
            LyricsSource::Musixmatch => "musixmatch",
            LyricsSource::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "lrclib" => LyricsSource::Lrclib,
            "ovh" => LyricsSource::Ovh,
            "musixmatch" => LyricsSource::Musixmatch,
            _ => LyricsSource::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumImage {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    pub artists: Vec<Artist>,
    /// Date string as reported by the platform; precision says how much of
    /// it is meaningful (year / month / day).
    pub release_date: String,
    pub release_date_precision: String,
    pub images: Vec<AlbumImage>,
    pub genres: Vec<String>,
}

impl Album {
    /// Largest image at or above `min_size` on either axis, falling back to
    /// the largest available.
    pub fn best_image(&self, min_size: u32) -> Option<&AlbumImage> {
        let suitable: Vec<&AlbumImage> = self
            .images
            .iter()
            .filter(|img| img.width >= min_size || img.height >= min_size)
            .collect();
        if !suitable.is_empty() {
            return suitable.into_iter().max_by_key(|img| img.width as u64 * img.height as u64);
        }
        self.images.iter().max_by_key(|img| img.width as u64 * img.height as u64)
    }

    /// First four characters of the release date (the year).
    pub fn release_year(&self) -> Option<&str> {
        if self.release_date.len() >= 4 {
            Some(&self.release_date[..4])
        } else {
            None
        }
    }
}

/// A track as reported by the source catalog. Immutable within a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    /// Ordered; the first artist is primary.
    pub artists: Vec<Artist>,
    pub album: Album,
    pub duration_ms: u64,
    pub explicit: bool,
    pub track_number: u32,
    pub disc_number: u32,
    pub isrc: Option<String>,
    pub is_playable: bool,
}

impl Track {
    pub fn primary_artist(&self) -> &str {
        self.artists.first().map(|a| a.name.as_str()).unwrap_or("Unknown Artist")
    }

    pub fn all_artists(&self) -> String {
        self.artists.iter().map(|a| a.name.as_str()).collect::<Vec<_>>().join(", ")
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_ms / 1000
    }

    pub fn duration_str(&self) -> String {
        crate::util::format_duration(self.duration_secs())
    }
}

/// A track in playlist context, carrying all per-track sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistTrack {
    pub track: Track,
    /// 1-based position in the playlist.
    pub position: u32,
    pub added_at: Option<DateTime<Utc>>,

    pub audio_status: AudioStatus,
    pub lyrics_status: LyricsStatus,

    pub local_file_path: Option<String>,
    pub lyrics_file_path: Option<String>,
    pub lyrics_source: Option<LyricsSource>,

    pub download_attempts: u32,
    pub lyrics_attempts: u32,
    pub last_download_attempt: Option<DateTime<Utc>>,
    pub last_lyrics_attempt: Option<DateTime<Utc>>,
    pub download_error: Option<String>,
    pub lyrics_error: Option<String>,

    /// Chosen secondary-catalog item, when resolved.
    pub matched_video_id: Option<String>,
    pub match_score: Option<f64>,
}

impl PlaylistTrack {
    pub fn new(track: Track, position: u32, added_at: Option<DateTime<Utc>>) -> Self {
        Self {
            track,
            position,
            added_at,
            audio_status: AudioStatus::Pending,
            lyrics_status: LyricsStatus::Pending,
            local_file_path: None,
            lyrics_file_path: None,
            lyrics_source: None,
            download_attempts: 0,
            lyrics_attempts: 0,
            last_download_attempt: None,
            last_lyrics_attempt: None,
            download_error: None,
            lyrics_error: None,
            matched_video_id: None,
            match_score: None,
        }
    }

    pub fn status_icons(&self) -> String {
        format!("{}{}", self.audio_status.icon(), self.lyrics_status.icon())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub public: Option<bool>,
    pub collaborative: Option<bool>,
    /// Opaque remote version token; equal values imply unchanged membership.
    pub snapshot_id: Option<String>,
    pub total_tracks: u32,
    pub tracks: Vec<PlaylistTrack>,
}

impl Playlist {
    pub fn track_by_id(&self, id: &str) -> Option<&PlaylistTrack> {
        self.tracks.iter().find(|t| t.track.id == id)
    }

    pub fn downloaded_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.audio_status == AudioStatus::Downloaded).count()
    }

    pub fn lyrics_downloaded_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.lyrics_status == LyricsStatus::Downloaded).count()
    }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub playlist_id: String,
    pub playlist_name: String,
    pub operations_performed: usize,
    pub downloads_completed: usize,
    pub downloads_failed: usize,
    pub lyrics_completed: usize,
    pub lyrics_failed: usize,
    pub moves_applied: usize,
    pub elapsed_secs: f64,
    pub error_message: Option<String>,
}

impl SyncResult {
    pub fn summary(&self) -> String {
        if !self.success {
            return format!(
                "Sync failed: {}",
                self.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        let mut parts = Vec::new();
        if self.downloads_completed > 0 {
            parts.push(format!("{} downloaded", self.downloads_completed));
        }
        if self.downloads_failed > 0 {
            parts.push(format!("{} failed", self.downloads_failed));
        }
        if self.lyrics_completed > 0 {
            parts.push(format!("{} lyrics", self.lyrics_completed));
        }
        if self.moves_applied > 0 {
            parts.push(format!("{} moved", self.moves_applied));
        }
        if parts.is_empty() {
            return "No changes needed".into();
        }
        parts.push(format!("{:.1}s elapsed", self.elapsed_secs));
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album_with_images(sizes: &[(u32, u32)]) -> Album {
        Album {
            id: "al1".into(),
            name: "Album".into(),
            artists: vec![],
            release_date: "2019-06-01".into(),
            release_date_precision: "day".into(),
            images: sizes
                .iter()
                .map(|(w, h)| AlbumImage { url: format!("u{}x{}", w, h), width: *w, height: *h })
                .collect(),
            genres: vec![],
        }
    }

    #[test]
    fn best_image_prefers_large_enough() {
        let album = album_with_images(&[(64, 64), (300, 300), (640, 640)]);
        assert_eq!(album.best_image(300).unwrap().width, 640);
        // Nothing big enough: fall back to largest available.
        let small = album_with_images(&[(64, 64), (100, 100)]);
        assert_eq!(small.best_image(300).unwrap().width, 100);
        let empty = album_with_images(&[]);
        assert!(empty.best_image(300).is_none());
    }

    #[test]
    fn release_year() {
        let album = album_with_images(&[]);
        assert_eq!(album.release_year(), Some("2019"));
    }

    #[test]
    fn status_icons_round_trip() {
        for s in [
            AudioStatus::Pending,
            AudioStatus::Downloading,
            AudioStatus::Downloaded,
            AudioStatus::Failed,
            AudioStatus::Skipped,
        ] {
            assert_eq!(AudioStatus::from_icon(s.icon()), Some(s));
        }
        for s in [
            LyricsStatus::Pending,
            LyricsStatus::Downloading,
            LyricsStatus::Downloaded,
            LyricsStatus::Failed,
            LyricsStatus::NotFound,
            LyricsStatus::Instrumental,
            LyricsStatus::Skipped,
        ] {
            assert_eq!(LyricsStatus::from_icon(s.icon()), Some(s));
        }
    }

    #[test]
    fn sync_result_summary() {
        let r = SyncResult {
            success: true,
            playlist_id: "p".into(),
            playlist_name: "P".into(),
            operations_performed: 4,
            downloads_completed: 3,
            downloads_failed: 1,
            lyrics_completed: 2,
            lyrics_failed: 0,
            moves_applied: 0,
            elapsed_secs: 12.5,
            error_message: None,
        };
        let s = r.summary();
        assert!(s.contains("3 downloaded"));
        assert!(s.contains("1 failed"));
        assert!(s.contains("2 lyrics"));
    }
}
