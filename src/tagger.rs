//! Tag embedding for downloaded audio (ID3v2 / Vorbis comments / MP4 ilst)
//! plus cover-art handling and post-download file validation. Tagging
//! failures are non-fatal: the audio file is kept either way.

use crate::config::MetadataConfig;
use crate::error::{Result, SyncError};
use crate::models::{LyricsSource, Track};
use lofty::config::WriteOptions;
use lofty::file::AudioFile;
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::probe::read_from_path;
use lofty::tag::{Accessor, ItemKey, Tag, TagExt, TagType};
use log::{debug, warn};
use std::path::Path;

const MIN_COVER_SIZE: u32 = 300;
const MAX_COVER_DIMENSION: u32 = 1000;
const COVER_JPEG_QUALITY: u8 = 90;

pub struct Tagger {
    client: reqwest::Client,
    metadata: MetadataConfig,
    format: String,
}

impl Tagger {
    pub fn new(client: reqwest::Client, metadata: MetadataConfig, format: String) -> Self {
        Self { client, metadata, format }
    }

    fn tag_type(&self) -> TagType {
        match self.format.as_str() {
            "flac" => TagType::VorbisComments,
            "m4a" => TagType::Mp4Ilst,
            _ => TagType::Id3v2,
        }
    }

    /// Embed track metadata, optional cover art and optional lyrics into the
    /// audio file. The playlist position, when given, wins over the album
    /// track number.
    pub async fn embed_metadata(
        &self,
        path: &Path,
        track: &Track,
        playlist_position: Option<u32>,
        lyrics_plain: Option<&str>,
        lyrics_synced: Option<&str>,
        lyrics_source: Option<LyricsSource>,
    ) -> Result<()> {
        let mut tag = Tag::new(self.tag_type());

        tag.set_title(track.title.clone());
        tag.set_artist(track.all_artists());
        tag.set_album(track.album.name.clone());

        let album_artist = track
            .album
            .artists
            .first()
            .map(|a| a.name.clone())
            .unwrap_or_else(|| track.primary_artist().to_string());
        tag.insert_text(ItemKey::AlbumArtist, album_artist);

        if let Some(year) = track.album.release_year().and_then(|y| y.parse::<u32>().ok()) {
            tag.set_year(year);
        }
        tag.set_track(playlist_position.unwrap_or(track.track_number));
        tag.set_disk(track.disc_number);
        if let Some(genre) = track.album.genres.first() {
            tag.set_genre(genre.clone());
        }
        if self.metadata.add_comment {
            tag.set_comment(comment_text(lyrics_source));
        }

        // Prefer embedding timestamped lyrics when they parse; players
        // handle LRC inside the lyrics tag. Fall back to plain text.
        let lyrics_text = match lyrics_synced {
            Some(lrc) if !crate::lyrics::parse_lrc(lrc).is_empty() => Some(lrc),
            _ => lyrics_plain,
        };
        if let Some(text) = lyrics_text {
            tag.insert_text(ItemKey::Lyrics, text.to_string());
        }

        if self.metadata.include_album_art {
            match self.fetch_cover_art(track).await {
                Some(jpeg) => {
                    let picture = Picture::new_unchecked(
                        PictureType::CoverFront,
                        Some(MimeType::Jpeg),
                        None,
                        jpeg,
                    );
                    tag.push_picture(picture);
                }
                None => debug!("no usable cover art for {}", track.title),
            }
        }

        tag.save_to_path(path, WriteOptions::default())
            .map_err(|e| SyncError::Tagger(format!("failed to write tags: {}", e)))?;
        debug!("tagged {}", path.display());
        Ok(())
    }

    async fn fetch_cover_art(&self, track: &Track) -> Option<Vec<u8>> {
        let image = track.album.best_image(MIN_COVER_SIZE)?;
        let bytes = match self.client.get(&image.url).send().await {
            Ok(resp) => resp.bytes().await.ok()?,
            Err(e) => {
                warn!("cover art fetch failed: {}", e);
                return None;
            }
        };
        match process_cover_art(&bytes) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!("cover art processing failed: {}", e);
                None
            }
        }
    }
}

fn comment_text(lyrics_source: Option<LyricsSource>) -> String {
    match lyrics_source {
        Some(source) => format!(
            "Mirrored by music-playlist-offline-sync | Lyrics: {}",
            source.as_str()
        ),
        None => "Mirrored by music-playlist-offline-sync".into(),
    }
}

/// Decode, downscale to at most 1000x1000 and re-encode as JPEG q=90.
pub fn process_cover_art(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| SyncError::Tagger(format!("unreadable cover image: {}", e)))?;
    let img = if img.width() > MAX_COVER_DIMENSION || img.height() > MAX_COVER_DIMENSION {
        img.thumbnail(MAX_COVER_DIMENSION, MAX_COVER_DIMENSION)
    } else {
        img
    };
    let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, COVER_JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .map_err(|e| SyncError::Tagger(format!("jpeg encode failed: {}", e)))?;
    Ok(out)
}

/// A downloaded file is valid when it exists, is non-empty, carries the
/// configured extension and probes as real audio.
pub fn validate_audio_file(path: &Path, expected_format: &str) -> bool {
    if !path.is_file() {
        return false;
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {}
        _ => return false,
    }
    let expected_ext = crate::util::file_extension_for(expected_format);
    let ext_matches = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()) == expected_ext)
        .unwrap_or(false);
    if !ext_matches {
        return false;
    }
    match read_from_path(path) {
        Ok(tagged) => !tagged.properties().duration().is_zero(),
        Err(e) => {
            warn!("audio probe failed for {}: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_art_is_downscaled_and_jpeg() {
        // 1200x1200 gray PNG in memory.
        let src = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            1200,
            1200,
            image::Rgb([128, 128, 128]),
        ));
        let mut png = Vec::new();
        src.write_with_encoder(image::codecs::png::PngEncoder::new(&mut png)).unwrap();

        let jpeg = process_cover_art(&png).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert!(decoded.width() <= 1000 && decoded.height() <= 1000);
        assert_eq!(image::guess_format(&jpeg).unwrap(), image::ImageFormat::Jpeg);
    }

    #[test]
    fn small_cover_art_not_upscaled() {
        let src = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            400,
            400,
            image::Rgb([10, 20, 30]),
        ));
        let mut png = Vec::new();
        src.write_with_encoder(image::codecs::png::PngEncoder::new(&mut png)).unwrap();
        let jpeg = process_cover_art(&png).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 400);
    }

    #[test]
    fn garbage_cover_rejected() {
        assert!(process_cover_art(b"not an image").is_err());
    }

    #[test]
    fn missing_file_invalid() {
        assert!(!validate_audio_file(Path::new("/nonexistent/file.mp3"), "mp3"));
    }

    #[test]
    fn wrong_extension_invalid() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("song.wav");
        std::fs::write(&path, b"RIFFdata").unwrap();
        assert!(!validate_audio_file(&path, "mp3"));
    }
}
