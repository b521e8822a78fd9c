use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    provider TEXT PRIMARY KEY,
    token_json TEXT NOT NULL,
    client_id TEXT,
    client_secret TEXT,
    last_refreshed INTEGER
);
CREATE TABLE IF NOT EXISTS match_cache (
    source_track_id TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    score REAL,
    resolved_at INTEGER
);
";

pub fn open_or_create(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Save raw credential JSON for a provider, with optional client_id/client_secret
pub fn save_credential_raw(
    conn: &Connection,
    provider: &str,
    json_blob: &str,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO credentials (provider, token_json, client_id, client_secret, last_refreshed) VALUES (?1, ?2, ?3, ?4, strftime('%s','now')) ON CONFLICT(provider) DO UPDATE SET token_json = excluded.token_json, client_id = excluded.client_id, client_secret = excluded.client_secret, last_refreshed = strftime('%s','now')",
        params![provider, json_blob, client_id, client_secret],
    )?;
    Ok(())
}

/// Load raw credential JSON and client_id/client_secret for a provider
pub fn load_credential_with_client(
    conn: &Connection,
    provider: &str,
) -> Result<Option<(String, Option<String>, Option<String>)>> {
    let mut stmt = conn.prepare(
        "SELECT token_json, client_id, client_secret FROM credentials WHERE provider = ?1 LIMIT 1",
    )?;
    let row = stmt
        .query_row(params![provider], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })
        .optional()?;
    Ok(row)
}

pub fn delete_credential(conn: &Connection, provider: &str) -> Result<()> {
    conn.execute("DELETE FROM credentials WHERE provider = ?1", params![provider])?;
    Ok(())
}

/// Lookup a cached resolver match for a source track id
pub fn get_cached_match(
    conn: &Connection,
    source_track_id: &str,
) -> Result<Option<(String, Option<f64>)>> {
    let mut stmt = conn
        .prepare("SELECT video_id, score FROM match_cache WHERE source_track_id = ?1 LIMIT 1")?;
    let row = stmt
        .query_row(params![source_track_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?))
        })
        .optional()?;
    Ok(row)
}

/// Upsert a resolver match: source_track_id -> (video_id, score)
pub fn upsert_cached_match(
    conn: &Connection,
    source_track_id: &str,
    video_id: &str,
    score: Option<f64>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO match_cache (source_track_id, video_id, score, resolved_at) VALUES (?1, ?2, ?3, strftime('%s','now')) ON CONFLICT(source_track_id) DO UPDATE SET video_id = excluded.video_id, score = excluded.score, resolved_at = strftime('%s','now')",
        params![source_track_id, video_id, score],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_round_trip() {
        let td = tempfile::tempdir().unwrap();
        let conn = open_or_create(&td.path().join("t.db")).unwrap();
        save_credential_raw(&conn, "source", r#"{"access_token":"x"}"#, Some("cid"), None).unwrap();
        let (json, cid, secret) = load_credential_with_client(&conn, "source").unwrap().unwrap();
        assert!(json.contains("access_token"));
        assert_eq!(cid.as_deref(), Some("cid"));
        assert!(secret.is_none());
        delete_credential(&conn, "source").unwrap();
        assert!(load_credential_with_client(&conn, "source").unwrap().is_none());
    }

    #[test]
    fn match_cache_round_trip() {
        let td = tempfile::tempdir().unwrap();
        let conn = open_or_create(&td.path().join("t.db")).unwrap();
        assert!(get_cached_match(&conn, "t1").unwrap().is_none());
        upsert_cached_match(&conn, "t1", "vid1", Some(88.5)).unwrap();
        let (vid, score) = get_cached_match(&conn, "t1").unwrap().unwrap();
        assert_eq!(vid, "vid1");
        assert_eq!(score, Some(88.5));
        // Upsert replaces.
        upsert_cached_match(&conn, "t1", "vid2", None).unwrap();
        assert_eq!(get_cached_match(&conn, "t1").unwrap().unwrap().0, "vid2");
    }
}
