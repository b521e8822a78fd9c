use music_playlist_offline_sync::manifest;
use music_playlist_offline_sync::models::{
    Album, Artist, AudioStatus, LyricsStatus, Playlist, PlaylistTrack, Track,
};
use tempfile::tempdir;

fn sample_track(id: &str, pos: u32, title: &str, duration_ms: u64) -> PlaylistTrack {
    let track = Track {
        id: id.into(),
        title: title.into(),
        artists: vec![Artist { id: "a1".into(), name: "Artist".into() }],
        album: Album {
            id: "al1".into(),
            name: "Album".into(),
            artists: vec![],
            release_date: "2020-05-01".into(),
            release_date_precision: "day".into(),
            images: vec![],
            genres: vec![],
        },
        duration_ms,
        explicit: false,
        track_number: 1,
        disc_number: 1,
        isrc: None,
        is_playable: true,
    };
    PlaylistTrack::new(track, pos, None)
}

fn sample_playlist(n: usize) -> Playlist {
    let tracks = (1..=n)
        .map(|i| sample_track(&format!("id{:022}", i), i as u32, &format!("Track {}", i), 200_000))
        .collect();
    Playlist {
        id: "pl123".into(),
        name: "Road Trip".into(),
        description: "desc".into(),
        owner: "owner".into(),
        public: Some(true),
        collaborative: Some(false),
        snapshot_id: Some("snap1".into()),
        total_tracks: n as u32,
        tracks,
    }
}

#[test]
fn create_then_read_round_trip() {
    let td = tempdir().unwrap();
    let playlist = sample_playlist(3);
    let path = manifest::create(&playlist, td.path(), true, "lrclib", true).unwrap();
    assert!(path.ends_with("tracklist.txt"));

    let (header, entries) = manifest::read(&path).unwrap();
    assert_eq!(header.playlist_name, "Road Trip");
    assert_eq!(header.source_id, "pl123");
    assert_eq!(header.total_tracks, 3);
    assert!(header.lyrics_enabled);
    assert_eq!(header.lyrics_source, "lrclib");
    assert_eq!(header.description.as_deref(), Some("desc"));
    assert_eq!(header.public, Some(true));

    assert_eq!(entries.len(), 3);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.position, (i + 1) as u32);
        assert_eq!(entry.audio_status, AudioStatus::Pending);
        assert_eq!(entry.lyrics_status, LyricsStatus::Pending);
        assert_eq!(entry.duration, "3:20");
    }
}

#[test]
fn update_is_atomic_and_backs_up() {
    let td = tempdir().unwrap();
    let mut playlist = sample_playlist(2);
    let path = manifest::create(&playlist, td.path(), true, "lrclib", false).unwrap();

    playlist.tracks[0].audio_status = AudioStatus::Downloaded;
    playlist.tracks[0].local_file_path = Some("01 - Artist - Track 1.m4a".into());
    manifest::update(&path, &playlist.tracks, None, true).unwrap();

    // No leftover temp file, and a timestamped backup exists.
    let names: Vec<String> = std::fs::read_dir(td.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(!names.iter().any(|n| n.ends_with(".tmp")));
    assert!(names.iter().any(|n| n.contains(".backup_")));

    let (header, entries) = manifest::read(&path).unwrap();
    assert_eq!(header.total_tracks, 2);
    assert_eq!(entries[0].audio_status, AudioStatus::Downloaded);
    assert_eq!(entries[0].local_file.as_deref(), Some("01 - Artist - Track 1.m4a"));
}

#[test]
fn header_patch_applied_on_update() {
    let td = tempdir().unwrap();
    let playlist = sample_playlist(1);
    let path = manifest::create(&playlist, td.path(), true, "lrclib", false).unwrap();
    manifest::update(
        &path,
        &playlist.tracks,
        Some(&|header| header.playlist_name = "Renamed".into()),
        false,
    )
    .unwrap();
    let (header, _) = manifest::read(&path).unwrap();
    assert_eq!(header.playlist_name, "Renamed");
}

#[test]
fn unparseable_track_lines_are_skipped() {
    let td = tempdir().unwrap();
    let playlist = sample_playlist(2);
    let path = manifest::create(&playlist, td.path(), true, "lrclib", false).unwrap();

    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("this line is garbage\n");
    content.push_str("✅🎵 totally broken\n");
    std::fs::write(&path, content).unwrap();

    let (_, entries) = manifest::read(&path).unwrap();
    assert_eq!(entries.len(), 2);
}

#[test]
fn missing_header_is_fatal() {
    let td = tempdir().unwrap();
    let path = td.path().join("tracklist.txt");
    std::fs::write(&path, "✅🎵 01. A - B (3:20) [source:track:x]\n").unwrap();
    assert!(manifest::read(&path).is_err());

    std::fs::write(&path, "").unwrap();
    assert!(manifest::read(&path).is_err());

    assert!(manifest::read(&td.path().join("nope.txt")).is_err());
}

#[test]
fn validate_reports_issues() {
    let td = tempdir().unwrap();
    let playlist = sample_playlist(2);
    let path = manifest::create(&playlist, td.path(), true, "lrclib", false).unwrap();
    assert!(manifest::validate(&path).unwrap().is_empty());

    // Drop one track line: count mismatch.
    let content = std::fs::read_to_string(&path).unwrap();
    let trimmed: Vec<&str> = content.lines().collect();
    let without_last = trimmed[..trimmed.len() - 1].join("\n");
    std::fs::write(&path, without_last).unwrap();
    let issues = manifest::validate(&path).unwrap();
    assert!(issues.iter().any(|i| i.contains("count mismatch")));
}

#[test]
fn find_manifests_walks_tree() {
    let td = tempdir().unwrap();
    let a = td.path().join("one");
    let b = td.path().join("nested").join("two");
    manifest::create(&sample_playlist(1), &a, true, "lrclib", false).unwrap();
    manifest::create(&sample_playlist(1), &b, true, "lrclib", false).unwrap();
    let found = manifest::find_manifests(td.path());
    assert_eq!(found.len(), 2);
}

#[test]
fn diff_from_disk_is_idempotent() {
    let td = tempdir().unwrap();
    let mut playlist = sample_playlist(3);
    for track in &mut playlist.tracks {
        track.audio_status = AudioStatus::Downloaded;
    }
    let path = manifest::create(&playlist, td.path(), true, "lrclib", false).unwrap();
    let (_, entries) = manifest::read(&path).unwrap();
    let diff = manifest::diff(&entries, &playlist.tracks, true);
    assert!(diff.is_empty(), "unexpected diff: {}", diff.summary());
}
