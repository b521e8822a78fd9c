//! The `tracklist.txt` manifest: authoritative local state for incremental
//! sync. Line-oriented UTF-8, `#` header comments, one line per track.

use crate::error::{Result, SyncError};
use crate::models::{AudioStatus, LyricsStatus, Playlist, PlaylistTrack};
use crate::util;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "tracklist.txt";
pub const FORMAT_VERSION: &str = "2.0";

static TRACK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\.\s+(.+?)\s+-\s+(.+?)\s+\(([^)]+)\)\s+\[source:track:([^\]]+)\](.*)$")
        .unwrap()
});
static FILE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"->\s*([^|]+)").unwrap());
static LYRICS_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"Lyrics:\s*([^|]+)").unwrap());

const AUDIO_ICONS: &[(&str, AudioStatus)] = &[
    ("✅", AudioStatus::Downloaded),
    ("⏭️", AudioStatus::Skipped),
    ("⬇️", AudioStatus::Downloading),
    ("⏳", AudioStatus::Pending),
    ("❌", AudioStatus::Failed),
];

const LYRICS_ICONS: &[(&str, LyricsStatus)] = &[
    ("🎵", LyricsStatus::Downloaded),
    ("🚫", LyricsStatus::NotFound),
    ("🎼", LyricsStatus::Instrumental),
    ("⏭️", LyricsStatus::Skipped),
    ("⬇️", LyricsStatus::Downloading),
    ("⏳", LyricsStatus::Pending),
    ("❌", LyricsStatus::Failed),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestHeader {
    pub format_version: String,
    pub playlist_name: String,
    pub source_id: String,
    pub created: String,
    pub total_tracks: u32,
    pub last_modified: String,
    pub lyrics_enabled: bool,
    pub lyrics_source: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub public: Option<bool>,
    pub collaborative: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub position: u32,
    pub artists: String,
    pub title: String,
    /// Duration string as written (`m:ss`, `mm:ss` or `h:mm:ss`).
    pub duration: String,
    pub source_id: String,
    pub audio_status: AudioStatus,
    pub lyrics_status: LyricsStatus,
    pub local_file: Option<String>,
    pub lyrics_ref: Option<String>,
}

impl ManifestEntry {
    pub fn duration_secs(&self) -> Option<u64> {
        util::parse_duration_str(&self.duration)
    }
}

/// Differences between the manifest and the current remote playlist. Indexes
/// refer into the remote track slice the diff was computed against.
#[derive(Debug, Default)]
pub struct ManifestDiff {
    pub added: Vec<usize>,
    pub removed: Vec<ManifestEntry>,
    /// (remote index, old position)
    pub moved: Vec<(usize, u32)>,
    pub modified: Vec<usize>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
            && self.modified.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("{} tracks added", self.added.len()));
        }
        if !self.removed.is_empty() {
            parts.push(format!("{} tracks removed", self.removed.len()));
        }
        if !self.moved.is_empty() {
            parts.push(format!("{} tracks moved", self.moved.len()));
        }
        if !self.modified.is_empty() {
            parts.push(format!("{} tracks modified", self.modified.len()));
        }
        if parts.is_empty() {
            return "No changes detected".into();
        }
        parts.join(", ")
    }
}

pub fn manifest_path(directory: &Path) -> PathBuf {
    directory.join(MANIFEST_FILE)
}

pub fn header_from_playlist(
    playlist: &Playlist,
    lyrics_enabled: bool,
    lyrics_source: &str,
) -> ManifestHeader {
    let now = chrono::Utc::now().to_rfc3339();
    ManifestHeader {
        format_version: FORMAT_VERSION.into(),
        playlist_name: playlist.name.clone(),
        source_id: playlist.id.clone(),
        created: now.clone(),
        total_tracks: playlist.tracks.len() as u32,
        last_modified: now,
        lyrics_enabled,
        lyrics_source: lyrics_source.into(),
        description: if playlist.description.is_empty() {
            None
        } else {
            Some(playlist.description.clone())
        },
        owner: if playlist.owner.is_empty() { None } else { Some(playlist.owner.clone()) },
        public: playlist.public,
        collaborative: playlist.collaborative,
    }
}

/// Create a fresh manifest for `playlist` in `directory`. Backs up any
/// existing manifest first when `backup` is set.
pub fn create(
    playlist: &Playlist,
    directory: &Path,
    lyrics_enabled: bool,
    lyrics_source: &str,
    backup: bool,
) -> Result<PathBuf> {
    ensure_writable_dir(directory)?;
    let path = manifest_path(directory);
    if path.exists() && backup {
        let backup_path = util::backup_filename(&path);
        if let Err(e) = std::fs::rename(&path, &backup_path) {
            log::warn!("failed to back up existing manifest: {}", e);
        } else {
            log::info!("created manifest backup: {}", backup_path.display());
        }
    }
    let header = header_from_playlist(playlist, lyrics_enabled, lyrics_source);
    write_atomic(&path, &header, &playlist.tracks)?;
    log::info!("created manifest: {}", path.display());
    Ok(path)
}

/// Read and parse a manifest. Unparseable track lines are logged and
/// skipped; a missing or unparseable header is fatal.
pub fn read(path: &Path) -> Result<(ManifestHeader, Vec<ManifestEntry>)> {
    if !path.is_file() {
        return Err(SyncError::Manifest(format!("manifest not found: {}", path.display())));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Manifest(format!("cannot read {}: {}", path.display(), e)))?;
    if content.trim().is_empty() {
        return Err(SyncError::Manifest(format!("manifest is empty: {}", path.display())));
    }
    let header = parse_header(&content)?;
    let entries = parse_entries(&content);
    log::debug!("read manifest: {} ({} tracks)", header.playlist_name, entries.len());
    Ok((header, entries))
}

/// Rewrite the manifest with current track state, refreshing the
/// last-modified stamp and applying an optional header patch.
pub fn update(
    path: &Path,
    tracks: &[PlaylistTrack],
    patch: Option<&dyn Fn(&mut ManifestHeader)>,
    backup: bool,
) -> Result<()> {
    let (mut header, _) = read(path)?;
    header.last_modified = chrono::Utc::now().to_rfc3339();
    header.total_tracks = tracks.len() as u32;
    if let Some(patch) = patch {
        patch(&mut header);
    }
    if backup {
        let backup_path = util::backup_filename(path);
        if let Err(e) = std::fs::copy(path, &backup_path) {
            log::warn!("failed to back up manifest before update: {}", e);
        }
    }
    write_atomic(path, &header, tracks)?;
    log::info!("updated manifest: {}", path.display());
    Ok(())
}

/// Serialize and write via temp file + fsync + rename so a crash leaves
/// either the old file or the new one, never a mixture.
pub fn write_atomic(path: &Path, header: &ManifestHeader, tracks: &[PlaylistTrack]) -> Result<()> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    {
        let mut f = std::fs::File::create(&tmp)
            .map_err(|e| SyncError::Manifest(format!("cannot write {}: {}", tmp.display(), e)))?;
        f.write_all(render(header, tracks).as_bytes())
            .map_err(|e| SyncError::Manifest(format!("write failed: {}", e)))?;
        f.sync_all()
            .map_err(|e| SyncError::Manifest(format!("fsync failed: {}", e)))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| SyncError::Manifest(format!("rename into place failed: {}", e)))?;
    Ok(())
}

pub fn render(header: &ManifestHeader, tracks: &[PlaylistTrack]) -> String {
    let mut out = String::new();
    out.push_str("# Playlist Mirror Tracklist\n");
    out.push_str(&format!("# Format Version: {}\n", header.format_version));
    out.push_str(&format!("# Playlist: {}\n", header.playlist_name));
    out.push_str(&format!("# Source ID: {}\n", header.source_id));
    out.push_str(&format!("# Created: {}\n", header.created));
    out.push_str(&format!("# Total tracks: {}\n", header.total_tracks));
    out.push_str(&format!("# Last modified: {}\n", header.last_modified));
    out.push_str(&format!("# Lyrics enabled: {}\n", header.lyrics_enabled));
    out.push_str(&format!("# Lyrics source: {}\n", header.lyrics_source));
    if let Some(d) = &header.description {
        out.push_str(&format!("# Description: {}\n", d));
    }
    if let Some(o) = &header.owner {
        out.push_str(&format!("# Owner: {}\n", o));
    }
    if let Some(p) = header.public {
        out.push_str(&format!("# Public: {}\n", p));
    }
    if let Some(c) = header.collaborative {
        out.push_str(&format!("# Collaborative: {}\n", c));
    }
    out.push_str("#\n# Status Icons:\n");
    out.push_str("# Audio: ✅=Downloaded, ⏳=Pending, ❌=Failed, ⏭️=Skipped\n");
    out.push_str("# Lyrics: 🎵=Downloaded, 🚫=Not Found, 🎼=Instrumental, ⏳=Pending\n");
    out.push_str("#\n\n");

    for track in tracks {
        out.push_str(&render_track_line(track));
        out.push('\n');
    }
    out
}

pub fn render_track_line(track: &PlaylistTrack) -> String {
    let mut line = format!(
        "{} {:02}. {} - {} ({}) [source:track:{}]",
        track.status_icons(),
        track.position,
        track.track.all_artists(),
        track.track.title,
        track.track.duration_str(),
        track.track.id
    );
    if let Some(file) = &track.local_file_path {
        let name = Path::new(file)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(file.as_str());
        line.push_str(&format!(" -> {}", name));
    }
    if let Some(lyrics_file) = &track.lyrics_file_path {
        let name = Path::new(lyrics_file)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(lyrics_file.as_str());
        line.push_str(&format!(" | Lyrics: {}", name));
    } else if let Some(source) = &track.lyrics_source {
        line.push_str(&format!(" | Lyrics: {}", source.as_str()));
    }
    line
}

fn parse_header(content: &str) -> Result<ManifestHeader> {
    let mut fields: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("# ") {
            if let Some((key, value)) = rest.split_once(':') {
                let key = key.trim().to_lowercase().replace(' ', "_");
                fields.entry(key).or_insert_with(|| value.trim().to_string());
            }
        }
    }

    let playlist_name = fields
        .get("playlist")
        .cloned()
        .ok_or_else(|| SyncError::Manifest("header missing Playlist field".into()))?;
    let source_id = fields
        .get("source_id")
        .cloned()
        .ok_or_else(|| SyncError::Manifest("header missing Source ID field".into()))?;
    let total_tracks = fields
        .get("total_tracks")
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| SyncError::Manifest("header missing or invalid Total tracks field".into()))?;

    let parse_bool = |v: &String| v.eq_ignore_ascii_case("true");
    Ok(ManifestHeader {
        format_version: fields.get("format_version").cloned().unwrap_or_else(|| "1.0".into()),
        playlist_name,
        source_id,
        created: fields.get("created").cloned().unwrap_or_default(),
        total_tracks,
        last_modified: fields.get("last_modified").cloned().unwrap_or_default(),
        lyrics_enabled: fields.get("lyrics_enabled").map(parse_bool).unwrap_or(true),
        lyrics_source: fields.get("lyrics_source").cloned().unwrap_or_else(|| "lrclib".into()),
        description: fields.get("description").cloned(),
        owner: fields.get("owner").cloned(),
        public: fields.get("public").map(|v| parse_bool(v)),
        collaborative: fields.get("collaborative").map(|v| parse_bool(v)),
    })
}

fn parse_entries(content: &str) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    for (line_num, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_track_line(line) {
            Some(entry) => entries.push(entry),
            None => log::warn!("failed to parse manifest line {}: {}", line_num + 1, line),
        }
    }
    entries
}

pub fn parse_track_line(line: &str) -> Option<ManifestEntry> {
    let (audio_status, rest) = strip_audio_icon(line);
    let (lyrics_status, rest) = strip_lyrics_icon(rest);

    let caps = TRACK_LINE.captures(rest)?;
    let position: u32 = caps[1].parse().ok()?;
    let artists = caps[2].trim().to_string();
    let title = caps[3].trim().to_string();
    let duration = caps[4].trim().to_string();
    util::parse_duration_str(&duration)?;
    let source_id = caps[5].trim().to_string();
    let extra = caps.get(6).map(|m| m.as_str()).unwrap_or("");

    let local_file = FILE_REF
        .captures(extra)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty());
    let lyrics_ref = LYRICS_REF
        .captures(extra)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty());

    Some(ManifestEntry {
        position,
        artists,
        title,
        duration,
        source_id,
        audio_status,
        lyrics_status,
        local_file,
        lyrics_ref,
    })
}

fn strip_audio_icon(s: &str) -> (AudioStatus, &str) {
    for (icon, status) in AUDIO_ICONS {
        if let Some(rest) = s.strip_prefix(icon) {
            return (*status, rest);
        }
    }
    // Unknown icon: consume one symbol (plus a variation selector if
    // present) and fall back to pending so the track gets re-checked.
    log::warn!("unknown audio status icon in manifest line: {}", s);
    (AudioStatus::Pending, skip_symbol(s))
}

fn strip_lyrics_icon(s: &str) -> (LyricsStatus, &str) {
    for (icon, status) in LYRICS_ICONS {
        if let Some(rest) = s.strip_prefix(icon) {
            return (*status, rest);
        }
    }
    if s.starts_with(char::is_whitespace) {
        // Icon omitted entirely; tolerated.
        return (LyricsStatus::Pending, s);
    }
    log::warn!("unknown lyrics status icon in manifest line: {}", s);
    (LyricsStatus::Pending, skip_symbol(s))
}

fn skip_symbol(s: &str) -> &str {
    let mut chars = s.char_indices();
    let Some((_, _first)) = chars.next() else { return s };
    let mut rest_idx = s.len();
    if let Some((idx, c)) = chars.next() {
        if c == '\u{fe0f}' {
            rest_idx = chars.next().map(|(i, _)| i).unwrap_or(s.len());
        } else {
            rest_idx = idx;
        }
    }
    &s[rest_idx..]
}

/// Compare manifest entries against the current remote track list.
/// Duplicate ids are keyed on first occurrence; movement is only reported
/// when `detect_moves` is set.
pub fn diff(
    entries: &[ManifestEntry],
    remote: &[PlaylistTrack],
    detect_moves: bool,
) -> ManifestDiff {
    use std::collections::HashMap;
    let mut by_id: HashMap<&str, &ManifestEntry> = HashMap::new();
    for entry in entries {
        by_id.entry(entry.source_id.as_str()).or_insert(entry);
    }
    let mut remote_ids: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for t in remote {
        remote_ids.insert(t.track.id.as_str());
    }

    let mut diff = ManifestDiff::default();
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for (idx, track) in remote.iter().enumerate() {
        let id = track.track.id.as_str();
        match by_id.get(id) {
            None => diff.added.push(idx),
            Some(entry) => {
                // Only the first occurrence of a duplicated id is compared.
                if !seen.insert(id) {
                    continue;
                }
                if detect_moves && entry.position != track.position {
                    diff.moved.push((idx, entry.position));
                }
                if entry.artists != track.track.all_artists()
                    || entry.title != track.track.title
                    || entry.duration != track.track.duration_str()
                {
                    diff.modified.push(idx);
                }
            }
        }
    }
    for entry in entries {
        if !remote_ids.contains(entry.source_id.as_str()) {
            diff.removed.push(entry.clone());
        }
    }
    diff
}

/// Integrity issues in a manifest file; empty means valid.
pub fn validate(path: &Path) -> Result<Vec<String>> {
    let (header, entries) = read(path)?;
    let mut issues = Vec::new();
    if header.playlist_name.is_empty() {
        issues.push("missing playlist name".into());
    }
    if header.source_id.is_empty() {
        issues.push("missing source id".into());
    }
    if entries.is_empty() {
        issues.push("no track entries found".into());
    }
    if header.total_tracks as usize != entries.len() {
        issues.push(format!(
            "track count mismatch: header={}, entries={}",
            header.total_tracks,
            entries.len()
        ));
    }
    let mut positions = std::collections::HashSet::new();
    for entry in &entries {
        if !positions.insert(entry.position) {
            issues.push(format!("duplicate track position {}", entry.position));
        }
        if entry.source_id.is_empty() {
            issues.push(format!("missing source id at position {}", entry.position));
        }
    }
    Ok(issues)
}

/// All manifest files under `root`, for directory reuse and `list`.
pub fn find_manifests(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
        .map(|e| e.into_path())
        .collect()
}

fn ensure_writable_dir(directory: &Path) -> Result<()> {
    std::fs::create_dir_all(directory)
        .map_err(|e| SyncError::Config(format!("cannot create {}: {}", directory.display(), e)))?;
    let probe = directory.join(".write_probe");
    std::fs::File::create(&probe)
        .map_err(|e| SyncError::Config(format!("{} is not writable: {}", directory.display(), e)))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Album, Artist, Track};

    fn sample_track(id: &str, pos: u32, title: &str) -> PlaylistTrack {
        let track = Track {
            id: id.into(),
            title: title.into(),
            artists: vec![Artist { id: "a1".into(), name: "Artist".into() }],
            album: Album {
                id: "al1".into(),
                name: "Album".into(),
                artists: vec![],
                release_date: "2020-01-01".into(),
                release_date_precision: "day".into(),
                images: vec![],
                genres: vec![],
            },
            duration_ms: 204_000,
            explicit: false,
            track_number: 1,
            disc_number: 1,
            isrc: None,
            is_playable: true,
        };
        PlaylistTrack::new(track, pos, None)
    }

    #[test]
    fn track_line_round_trip() {
        let mut track = sample_track("abc123", 7, "Song Title");
        track.audio_status = AudioStatus::Downloaded;
        track.lyrics_status = LyricsStatus::Downloaded;
        track.local_file_path = Some("/music/pl/07 - Artist - Song Title.m4a".into());
        track.lyrics_file_path = Some("/music/pl/07 - Artist - Song Title.lrc".into());

        let line = render_track_line(&track);
        let entry = parse_track_line(&line).expect("parse");
        assert_eq!(entry.position, 7);
        assert_eq!(entry.artists, "Artist");
        assert_eq!(entry.title, "Song Title");
        assert_eq!(entry.duration, "3:24");
        assert_eq!(entry.source_id, "abc123");
        assert_eq!(entry.audio_status, AudioStatus::Downloaded);
        assert_eq!(entry.lyrics_status, LyricsStatus::Downloaded);
        assert_eq!(entry.local_file.as_deref(), Some("07 - Artist - Song Title.m4a"));
        assert_eq!(entry.lyrics_ref.as_deref(), Some("07 - Artist - Song Title.lrc"));
    }

    #[test]
    fn unknown_icon_falls_back_to_pending() {
        let line = "🤖🎵 01. Artist - Title (3:24) [source:track:xyz]";
        let entry = parse_track_line(line).expect("parse");
        assert_eq!(entry.audio_status, AudioStatus::Pending);
        assert_eq!(entry.lyrics_status, LyricsStatus::Downloaded);
    }

    #[test]
    fn hour_long_duration_accepted() {
        let line = "✅🎵 01. Artist - Long Set (1:02:03) [source:track:xyz]";
        let entry = parse_track_line(line).expect("parse");
        assert_eq!(entry.duration_secs(), Some(3723));
    }

    #[test]
    fn diff_detects_added_removed_moved() {
        let entries = vec![
            ManifestEntry {
                position: 1,
                artists: "Artist".into(),
                title: "One".into(),
                duration: "3:24".into(),
                source_id: "id1".into(),
                audio_status: AudioStatus::Downloaded,
                lyrics_status: LyricsStatus::Downloaded,
                local_file: None,
                lyrics_ref: None,
            },
            ManifestEntry {
                position: 2,
                artists: "Artist".into(),
                title: "Two".into(),
                duration: "3:24".into(),
                source_id: "id2".into(),
                audio_status: AudioStatus::Downloaded,
                lyrics_status: LyricsStatus::Downloaded,
                local_file: None,
                lyrics_ref: None,
            },
        ];
        let remote = vec![
            sample_track("id2", 1, "Two"),
            sample_track("id3", 2, "Three"),
        ];
        let d = diff(&entries, &remote, true);
        assert_eq!(d.added, vec![1]);
        assert_eq!(d.removed.len(), 1);
        assert_eq!(d.removed[0].source_id, "id1");
        assert_eq!(d.moved, vec![(0, 2)]);
    }
}
