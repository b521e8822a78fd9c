use mockito::{Matcher, Server};
use music_playlist_offline_sync::api::auth::Auth;
use music_playlist_offline_sync::api::source::SourceClient;
use music_playlist_offline_sync::db;
use serde_json::json;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::tempdir;

// Base-URL env vars are process-wide; serialize the tests that set them.
fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn seed_token(db_path: &std::path::Path, access_token: &str, expires_in: i64, refresh: Option<&str>) {
    let conn = db::open_or_create(db_path).unwrap();
    let stored = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_at": chrono::Utc::now().timestamp() + expires_in,
        "refresh_token": refresh,
        "scope": ""
    })
    .to_string();
    db::save_credential_raw(&conn, "source", &stored, Some("cid"), Some("csecret")).unwrap();
}

fn client_with_token(db_path: std::path::PathBuf) -> SourceClient {
    let http = reqwest::Client::new();
    let auth = Arc::new(Auth::new(http.clone(), "cid".into(), "csecret".into(), db_path));
    SourceClient::new(http, auth)
}

#[test]
fn playlist_info_fetched() {
    let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
    let mut server = Server::new();
    std::env::set_var("SOURCE_API_BASE", server.url());
    std::env::set_var("SOURCE_AUTH_BASE", server.url());

    let _m = server
        .mock("GET", "/playlists/pl123")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "pl123",
                "name": "Focus",
                "description": "deep work",
                "owner": {"id": "u1", "display_name": "User One"},
                "public": true,
                "collaborative": false,
                "tracks": {"total": 2},
                "snapshot_id": "snapA"
            })
            .to_string(),
        )
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("t.db");
    seed_token(&db_path, "valid", 3600, None);
    let client = client_with_token(db_path);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let playlist = rt.block_on(client.get_playlist_info("pl123")).unwrap();
    assert_eq!(playlist.id, "pl123");
    assert_eq!(playlist.name, "Focus");
    assert_eq!(playlist.owner, "User One");
    assert_eq!(playlist.total_tracks, 2);
    assert_eq!(playlist.snapshot_id.as_deref(), Some("snapA"));
}

#[test]
fn expired_token_is_refreshed_before_request() {
    let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
    let mut server = Server::new();
    std::env::set_var("SOURCE_API_BASE", server.url());
    std::env::set_var("SOURCE_AUTH_BASE", server.url());

    let token_mock = server
        .mock("POST", "/api/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"access_token": "fresh", "expires_in": 3600}).to_string())
        .create();

    let api_mock = server
        .mock("GET", "/playlists/pl123")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "pl123", "name": "P", "description": "",
                "owner": {"id": "u"}, "tracks": {"total": 0}
            })
            .to_string(),
        )
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("t.db");
    // Expired token with a refresh token available.
    seed_token(&db_path, "stale", -100, Some("refr"));
    let client = client_with_token(db_path);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let playlist = rt.block_on(client.get_playlist_info("pl123")).unwrap();
    assert_eq!(playlist.id, "pl123");
    token_mock.assert();
    api_mock.assert();
}

#[test]
fn rate_limit_gives_up_after_retries() {
    let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
    let mut server = Server::new();
    std::env::set_var("SOURCE_API_BASE", server.url());
    std::env::set_var("SOURCE_AUTH_BASE", server.url());

    let _m = server
        .mock("GET", "/playlists/limited")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("retry-after", "0")
        .with_body("slow down")
        .expect_at_least(2)
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("t.db");
    seed_token(&db_path, "valid", 3600, None);
    let client = client_with_token(db_path);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let err = rt.block_on(client.get_playlist_info("limited")).unwrap_err();
    assert!(err.is_transient(), "expected transient error, got: {}", err);
}

#[test]
fn permanent_errors_are_not_transient() {
    let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
    let mut server = Server::new();
    std::env::set_var("SOURCE_API_BASE", server.url());
    std::env::set_var("SOURCE_AUTH_BASE", server.url());

    let _m = server
        .mock("GET", "/playlists/gone")
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body("not found")
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("t.db");
    seed_token(&db_path, "valid", 3600, None);
    let client = client_with_token(db_path);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let err = rt.block_on(client.get_playlist_info("gone")).unwrap_err();
    assert!(!err.is_transient());
    assert!(!rt.block_on(client.validate_playlist_access("gone")));
}

#[test]
fn null_tracks_skipped_but_positions_advance() {
    let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
    let mut server = Server::new();
    std::env::set_var("SOURCE_API_BASE", server.url());
    std::env::set_var("SOURCE_AUTH_BASE", server.url());

    let track = |id: &str, name: &str| {
        json!({
            "id": id, "name": name,
            "artists": [{"id": "a", "name": "Artist"}],
            "album": {
                "id": "al", "name": "Album",
                "release_date": "2020-01-01", "release_date_precision": "day",
                "images": []
            },
            "duration_ms": 200000, "explicit": false,
            "track_number": 1, "disc_number": 1
        })
    };
    let _m = server
        .mock("GET", "/playlists/pl123/tracks")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "items": [
                    {"added_at": "2023-01-01T00:00:00Z", "track": track("t1", "One")},
                    {"added_at": null, "track": null},
                    {"added_at": "2023-01-03T00:00:00Z", "track": track("t3", "Three")}
                ],
                "next": null,
                "total": 3
            })
            .to_string(),
        )
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("t.db");
    seed_token(&db_path, "valid", 3600, None);
    let client = client_with_token(db_path);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let tracks = rt.block_on(client.get_playlist_tracks("pl123")).unwrap();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].track.id, "t1");
    assert_eq!(tracks[0].position, 1);
    // The removed item keeps its slot: the next track is at position 3.
    assert_eq!(tracks[1].track.id, "t3");
    assert_eq!(tracks[1].position, 3);
    assert!(tracks[0].added_at.is_some());
}

#[test]
fn batch_track_lookup_enforces_limit() {
    let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
    let td = tempdir().unwrap();
    let db_path = td.path().join("t.db");
    seed_token(&db_path, "valid", 3600, None);
    let client = client_with_token(db_path);

    let rt = tokio::runtime::Runtime::new().unwrap();
    let too_many: Vec<String> = (0..51).map(|i| format!("id{}", i)).collect();
    assert!(rt.block_on(client.get_tracks(&too_many)).is_err());
    assert!(rt.block_on(client.get_tracks(&[])).unwrap().is_empty());
}
