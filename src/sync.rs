//! Sync planner/executor: diffs remote state against the local manifest,
//! builds the minimal operation list and runs it on a bounded worker pool.

use crate::api::auth::Auth;
use crate::api::source::SourceClient;
use crate::api::ytm::YtmClient;
use crate::config::{Config, NamingConfig};
use crate::db;
use crate::downloader::AudioDownloader;
use crate::error::{Result, SyncError};
use crate::http;
use crate::lyrics::{LyricsOutcome, LyricsResolver};
use crate::manifest::{self, ManifestEntry};
use crate::models::{
    AudioStatus, LyricsStatus, LyricsSource, Playlist, PlaylistTrack, SyncResult,
};
use crate::processor::AudioProcessor;
use crate::resolver::TrackResolver;
use crate::tagger::{self, Tagger};
use crate::util;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation flag, checked at suspension points.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadReason {
    Initial,
    TrackAdded,
    FileMissingOrInvalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Index into the playlist's track list.
    Download { index: usize, reason: DownloadReason },
    Move { index: usize, old_position: u32, new_position: u32 },
}

#[derive(Debug)]
pub struct SyncPlan {
    pub playlist_id: String,
    pub playlist_name: String,
    pub directory: PathBuf,
    pub operations: Vec<Operation>,
}

impl SyncPlan {
    pub fn has_changes(&self) -> bool {
        !self.operations.is_empty()
    }

    pub fn download_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Download { .. }))
            .count()
    }

    pub fn move_count(&self) -> usize {
        self.operations.iter().filter(|op| matches!(op, Operation::Move { .. })).count()
    }
}

/// Root context for a sync run: config snapshot, shared HTTP client,
/// remote clients, throttles and the cancellation token. Components take
/// it by reference; nothing is global.
pub struct SyncContext {
    pub cfg: Config,
    pub auth: Arc<Auth>,
    pub source: SourceClient,
    pub resolver: TrackResolver,
    pub downloader: AudioDownloader,
    pub tagger: Tagger,
    pub lyrics: LyricsResolver,
    pub processor: AudioProcessor,
    pub cancel: CancelToken,
}

impl SyncContext {
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let client = http::build_client();
        let (client_id, client_secret) = Config::source_client_credentials();
        let auth = Arc::new(Auth::new(
            client.clone(),
            client_id,
            client_secret,
            cfg.db_path.clone(),
        ));
        let source = SourceClient::new(client.clone(), auth.clone());
        let ytm = Arc::new(YtmClient::new(client.clone()));
        let resolver = TrackResolver::new(ytm, cfg.matching.clone());
        let downloader = AudioDownloader::new(cfg.output.clone(), cfg.audio.clone())?;
        let tagger = Tagger::new(client.clone(), cfg.metadata.clone(), cfg.output.format.clone());
        let lyrics = LyricsResolver::new(client, cfg.lyrics.clone());
        let processor = AudioProcessor::new(cfg.audio.clone());
        Ok(Self {
            cfg,
            auth,
            source,
            resolver,
            downloader,
            tagger,
            lyrics,
            processor,
            cancel: CancelToken::default(),
        })
    }

    /// Full sync: fetch remote, plan, execute, rewrite manifest.
    pub async fn sync_playlist(
        &self,
        reference: &str,
        directory_override: Option<PathBuf>,
    ) -> Result<SyncResult> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4();
        let playlist_id = SourceClient::extract_playlist_id(reference)?;
        info!("starting sync run {} for playlist {}", run_id, playlist_id);
        let mut playlist = self.source.get_full_playlist(&playlist_id).await?;
        let (plan, _entries) = self.plan_for(&mut playlist, directory_override)?;
        info!(
            "sync plan for '{}': {} downloads, {} moves",
            plan.playlist_name,
            plan.download_count(),
            plan.move_count()
        );
        self.execute(playlist, plan, started).await
    }

    /// Plan without executing (the `check` surface).
    pub async fn check_playlist(
        &self,
        reference: &str,
        directory_override: Option<PathBuf>,
    ) -> Result<SyncPlan> {
        let playlist_id = SourceClient::extract_playlist_id(reference)?;
        let mut playlist = self.source.get_full_playlist(&playlist_id).await?;
        let (plan, _) = self.plan_for(&mut playlist, directory_override)?;
        Ok(plan)
    }

    fn plan_for(
        &self,
        playlist: &mut Playlist,
        directory_override: Option<PathBuf>,
    ) -> Result<(SyncPlan, Vec<ManifestEntry>)> {
        let directory = match directory_override {
            Some(dir) => dir,
            None => self.find_playlist_directory(playlist)?,
        };
        let manifest_file = manifest::manifest_path(&directory);
        let format = self.cfg.output.format.clone();
        let validate = move |path: &Path| tagger::validate_audio_file(path, &format);

        if !manifest_file.exists() {
            let operations = (0..playlist.tracks.len())
                .map(|index| Operation::Download { index, reason: DownloadReason::Initial })
                .collect();
            return Ok((
                SyncPlan {
                    playlist_id: playlist.id.clone(),
                    playlist_name: playlist.name.clone(),
                    directory,
                    operations,
                },
                Vec::new(),
            ));
        }

        let (_header, entries) = manifest::read(&manifest_file)?;
        let operations = build_incremental_ops(
            playlist,
            &entries,
            &directory,
            self.cfg.sync.detect_moved_tracks,
            &validate,
        );
        Ok((
            SyncPlan {
                playlist_id: playlist.id.clone(),
                playlist_name: playlist.name.clone(),
                directory,
                operations,
            },
            entries,
        ))
    }

    /// Directory selection: reuse the sanitized-name directory when its
    /// manifest matches the remote id, otherwise search the output root for
    /// a manifest with the id, otherwise mint a fresh directory.
    fn find_playlist_directory(&self, playlist: &Playlist) -> Result<PathBuf> {
        let root = self.cfg.output_root();
        std::fs::create_dir_all(&root)
            .map_err(|e| SyncError::Config(format!("cannot create output root: {}", e)))?;

        let safe_name =
            util::sanitize_directory_name(&playlist.name, self.cfg.naming.max_filename_length);
        let candidate = root.join(&safe_name);
        if !candidate.starts_with(&root) {
            return Err(SyncError::Config(format!(
                "playlist directory would escape the output root: {}",
                candidate.display()
            )));
        }

        let manifest_file = manifest::manifest_path(&candidate);
        if manifest_file.exists() {
            match manifest::read(&manifest_file) {
                Ok((header, _)) if header.source_id == playlist.id => {
                    info!("reusing playlist directory: {}", candidate.display());
                    return Ok(candidate);
                }
                Ok(_) => debug!("directory {} belongs to a different playlist", safe_name),
                Err(e) => warn!("could not verify manifest in {}: {}", safe_name, e),
            }
        }

        // Renamed playlist: its manifest may live under another directory.
        for found in manifest::find_manifests(&root) {
            if let Ok((header, _)) = manifest::read(&found) {
                if header.source_id == playlist.id {
                    if let Some(parent) = found.parent() {
                        info!("found existing playlist directory: {}", parent.display());
                        return Ok(parent.to_path_buf());
                    }
                }
            }
        }

        if !candidate.exists() {
            return Ok(candidate);
        }
        for counter in 1..=100 {
            let alternative = root.join(format!("{}_{}", safe_name, counter));
            if !alternative.exists() {
                return Ok(alternative);
            }
        }
        Ok(root.join(format!("{}_{}", safe_name, chrono::Utc::now().timestamp())))
    }

    async fn execute(
        &self,
        mut playlist: Playlist,
        plan: SyncPlan,
        started: Instant,
    ) -> Result<SyncResult> {
        let directory = plan.directory.clone();
        self.downloader.sweep_staging();

        let mut downloads: Vec<(usize, PlaylistTrack)> = Vec::new();
        for op in &plan.operations {
            if let Operation::Download { index, .. } = op {
                downloads.push((*index, playlist.tracks[*index].clone()));
            }
        }

        let concurrency = self.cfg.output.concurrency.max(1);
        let results: Vec<(usize, PlaylistTrack)> = stream::iter(downloads)
            .map(|(index, track)| {
                let dir = directory.clone();
                async move { (index, self.process_download(track, &dir).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut downloads_completed = 0;
        let mut downloads_failed = 0;
        let mut lyrics_completed = 0;
        let mut lyrics_failed = 0;
        for (index, track) in results {
            match track.audio_status {
                AudioStatus::Downloaded => downloads_completed += 1,
                AudioStatus::Failed => downloads_failed += 1,
                _ => {}
            }
            if self.lyrics_wanted() {
                match track.lyrics_status {
                    LyricsStatus::Downloaded => lyrics_completed += 1,
                    LyricsStatus::Failed | LyricsStatus::NotFound => lyrics_failed += 1,
                    _ => {}
                }
            }
            playlist.tracks[index] = track;
        }

        // Moves only touch position bookkeeping; the refetched order below
        // is authoritative and files keep their names.
        let moves_applied = plan.move_count();

        // Refetch so the manifest reflects the remote as of run end, then
        // carry the run's per-track state over.
        let mut final_playlist = match self.source.get_full_playlist(&playlist.id).await {
            Ok(fresh) => {
                let mut fresh = fresh;
                merge_track_state(&mut fresh, &playlist);
                fresh
            }
            Err(e) => {
                warn!("post-run refetch failed ({}); writing executed state", e);
                playlist
            }
        };
        final_playlist.tracks.sort_by_key(|t| t.position);

        let manifest_file = manifest::manifest_path(&directory);
        if manifest_file.exists() {
            manifest::update(
                &manifest_file,
                &final_playlist.tracks,
                Some(&|header| {
                    header.playlist_name = final_playlist.name.clone();
                }),
                self.cfg.sync.backup_tracklist,
            )?;
        } else {
            manifest::create(
                &final_playlist,
                &directory,
                self.cfg.lyrics.enabled,
                &self.cfg.lyrics.primary_source,
                self.cfg.sync.backup_tracklist,
            )?;
        }

        let result = SyncResult {
            success: true,
            playlist_id: final_playlist.id.clone(),
            playlist_name: final_playlist.name.clone(),
            operations_performed: plan.operations.len(),
            downloads_completed,
            downloads_failed,
            lyrics_completed,
            lyrics_failed,
            moves_applied,
            elapsed_secs: started.elapsed().as_secs_f64(),
            error_message: if self.cancel.is_cancelled() {
                Some("cancelled by user".into())
            } else {
                None
            },
        };
        if let Err(e) = write_run_report(&directory, &final_playlist, &result) {
            warn!("failed to write run report: {}", e);
        }
        info!("sync finished: {}", result.summary());
        Ok(result)
    }

    /// Fetch lyrics for already-downloaded tracks that still lack them,
    /// write files/embed per config, and rewrite the manifest.
    pub async fn sync_lyrics_only(&self, reference: &str) -> Result<(usize, usize)> {
        let playlist_id = SourceClient::extract_playlist_id(reference)?;
        let mut playlist = self.source.get_full_playlist(&playlist_id).await?;
        let (plan, entries) = self.plan_for(&mut playlist, None)?;
        if entries.is_empty() {
            return Err(SyncError::Manifest(
                "no manifest found; run a full sync first".into(),
            ));
        }
        let directory = plan.directory;

        let mut completed = 0usize;
        let mut failed = 0usize;
        for track in &mut playlist.tracks {
            if self.cancel.is_cancelled() {
                break;
            }
            if track.audio_status != AudioStatus::Downloaded
                || matches!(
                    track.lyrics_status,
                    LyricsStatus::Downloaded | LyricsStatus::Instrumental
                )
            {
                continue;
            }
            let artist = track.track.primary_artist().to_string();
            let title = track.track.title.clone();
            track.lyrics_attempts += 1;
            track.last_lyrics_attempt = Some(chrono::Utc::now());
            match self
                .lyrics
                .search(&artist, &title, Some(track.track.album.name.as_str()), None)
                .await
            {
                Ok(LyricsOutcome::Found(lyrics)) => {
                    if let Ok(paths) = self.lyrics.save_files(
                        &lyrics,
                        &artist,
                        &title,
                        &directory,
                        Some(track.position),
                        self.cfg.naming.max_filename_length,
                    ) {
                        if let Some(first) = paths.first() {
                            track.lyrics_file_path = Some(first.to_string_lossy().into_owned());
                        }
                    }
                    if self.lyrics.embed_enabled() {
                        if let Some(file) = track.local_file_path.clone() {
                            let path = directory.join(&file);
                            if let Err(e) = self
                                .tagger
                                .embed_metadata(
                                    &path,
                                    &track.track,
                                    Some(track.position),
                                    Some(lyrics.plain.as_str()),
                                    lyrics.synced.as_deref(),
                                    Some(lyrics.source),
                                )
                                .await
                            {
                                warn!("embedding lyrics failed for {}: {}", title, e);
                            }
                        }
                    }
                    track.lyrics_status = LyricsStatus::Downloaded;
                    track.lyrics_source = Some(lyrics.source);
                    completed += 1;
                }
                Ok(LyricsOutcome::Instrumental) => {
                    track.lyrics_status = LyricsStatus::Instrumental;
                }
                Ok(LyricsOutcome::NotFound) => {
                    track.lyrics_status = LyricsStatus::NotFound;
                    failed += 1;
                }
                Err(e) => {
                    track.lyrics_status = LyricsStatus::Failed;
                    track.lyrics_error = Some(e.to_string());
                    failed += 1;
                }
            }
        }

        playlist.tracks.sort_by_key(|t| t.position);
        manifest::update(
            &manifest::manifest_path(&directory),
            &playlist.tracks,
            None,
            self.cfg.sync.backup_tracklist,
        )?;
        Ok((completed, failed))
    }

    fn lyrics_wanted(&self) -> bool {
        self.cfg.sync.sync_lyrics && self.cfg.lyrics.enabled
    }

    /// The per-track pipeline: resolve, download, validate, process,
    /// lyrics, tag. Each stage failure is recorded on the track; nothing
    /// here aborts the run.
    async fn process_download(&self, mut track: PlaylistTrack, directory: &Path) -> PlaylistTrack {
        if self.cancel.is_cancelled() {
            return track;
        }
        let artist = track.track.primary_artist().to_string();
        let title = track.track.title.clone();

        track.audio_status = AudioStatus::Downloading;
        track.download_attempts += 1;
        track.last_download_attempt = Some(chrono::Utc::now());
        track.download_error = None;

        // Resolve, via the match cache when possible.
        let (video_id, score) = match self.resolve_track(&track).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                track.audio_status = AudioStatus::Failed;
                track.download_error =
                    Some(format!("no suitable match found for {} - {}", artist, title));
                return track;
            }
            Err(e) => {
                track.audio_status = AudioStatus::Failed;
                track.download_error = Some(e.to_string());
                return track;
            }
        };
        track.matched_video_id = Some(video_id.clone());
        track.match_score = score;

        if self.cancel.is_cancelled() {
            track.audio_status = AudioStatus::Pending;
            return track;
        }

        let base_name = track_filename(&self.cfg.naming, &track);
        let base_path = directory.join(&base_name);
        let outcome = match self.downloader.download(&video_id, &base_path, None).await {
            Ok(outcome) => outcome,
            Err(e) => {
                track.audio_status = AudioStatus::Failed;
                track.download_error = Some(e.to_string());
                return track;
            }
        };

        if !tagger::validate_audio_file(&outcome.file_path, &self.cfg.output.format) {
            let _ = std::fs::remove_file(&outcome.file_path);
            track.audio_status = AudioStatus::Failed;
            track.download_error = Some("downloaded file failed validation".into());
            return track;
        }

        self.processor.process(&outcome.file_path).await;

        // Lyrics are resolved before tagging so they can be embedded.
        let mut resolved_lyrics = None;
        if self.lyrics_wanted() {
            track.lyrics_attempts += 1;
            track.last_lyrics_attempt = Some(chrono::Utc::now());
            match self
                .lyrics
                .search(&artist, &title, Some(track.track.album.name.as_str()), None)
                .await
            {
                Ok(LyricsOutcome::Found(lyrics)) => {
                    match self.lyrics.save_files(
                        &lyrics,
                        &artist,
                        &title,
                        directory,
                        Some(track.position),
                        self.cfg.naming.max_filename_length,
                    ) {
                        Ok(paths) => {
                            if let Some(first) = paths.first() {
                                track.lyrics_file_path =
                                    Some(first.to_string_lossy().into_owned());
                            }
                        }
                        Err(e) => warn!("saving lyrics files failed: {}", e),
                    }
                    track.lyrics_status = LyricsStatus::Downloaded;
                    track.lyrics_source = Some(lyrics.source);
                    resolved_lyrics = Some(lyrics);
                }
                Ok(LyricsOutcome::Instrumental) => {
                    track.lyrics_status = LyricsStatus::Instrumental;
                }
                Ok(LyricsOutcome::NotFound) => {
                    track.lyrics_status = LyricsStatus::NotFound;
                }
                Err(e) => {
                    track.lyrics_status = LyricsStatus::Failed;
                    track.lyrics_error = Some(e.to_string());
                }
            }
        } else {
            track.lyrics_status = LyricsStatus::Skipped;
        }

        let (plain, synced, source) = match &resolved_lyrics {
            Some(lyrics) if self.lyrics.embed_enabled() => (
                Some(lyrics.plain.as_str()),
                lyrics.synced.as_deref(),
                Some(lyrics.source),
            ),
            _ => (None, None, None),
        };
        if let Err(e) = self
            .tagger
            .embed_metadata(
                &outcome.file_path,
                &track.track,
                Some(track.position),
                plain,
                synced,
                source,
            )
            .await
        {
            // Non-fatal: keep the audio, note the problem.
            warn!("tagging failed for {}: {}", title, e);
        }

        track.audio_status = AudioStatus::Downloaded;
        track.local_file_path = Some(outcome.file_path.to_string_lossy().into_owned());
        info!("downloaded: {} - {}", artist, title);
        track
    }

    async fn resolve_track(&self, track: &PlaylistTrack) -> Result<Option<(String, Option<f64>)>> {
        let track_id = track.track.id.clone();
        let db_path = self.cfg.db_path.clone();
        let cached = tokio::task::spawn_blocking({
            let db_path = db_path.clone();
            let track_id = track_id.clone();
            move || -> anyhow::Result<Option<(String, Option<f64>)>> {
                let conn = db::open_or_create(&db_path)?;
                db::get_cached_match(&conn, &track_id)
            }
        })
        .await
        .map_err(|e| SyncError::Resolver(format!("cache task failed: {}", e)))?
        .unwrap_or(None);
        if let Some(hit) = cached {
            debug!("match cache hit for {}", track_id);
            return Ok(Some(hit));
        }

        let found = self
            .resolver
            .resolve(
                track.track.primary_artist(),
                &track.track.title,
                Some(track.track.duration_secs()),
                Some(track.track.album.name.as_str()),
            )
            .await?;
        let Some(scored) = found else { return Ok(None) };
        let video_id = scored.candidate.video_id.clone();
        let total = scored.total();

        let cache_id = video_id.clone();
        let _ = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = db::open_or_create(&db_path)?;
            db::upsert_cached_match(&conn, &track_id, &cache_id, Some(total))?;
            Ok(())
        })
        .await;
        Ok(Some((video_id, Some(total))))
    }
}

/// Seed per-track state from manifest entries and emit the incremental
/// operation list: downloads for added tracks and for entries whose local
/// file no longer validates, then moves (when enabled).
pub fn build_incremental_ops(
    playlist: &mut Playlist,
    entries: &[ManifestEntry],
    directory: &Path,
    detect_moves: bool,
    validate: &dyn Fn(&Path) -> bool,
) -> Vec<Operation> {
    seed_track_state(playlist, entries, directory);
    let diff = manifest::diff(entries, &playlist.tracks, detect_moves);

    let mut operations = Vec::new();
    for index in &diff.added {
        operations.push(Operation::Download {
            index: *index,
            reason: DownloadReason::TrackAdded,
        });
    }

    let added: std::collections::HashSet<usize> = diff.added.iter().copied().collect();
    for (index, track) in playlist.tracks.iter_mut().enumerate() {
        if added.contains(&index) {
            continue;
        }
        let valid = track
            .local_file_path
            .as_ref()
            .map(|file| validate(&directory.join(file)))
            .unwrap_or(false);
        if !valid {
            track.audio_status = AudioStatus::Pending;
            track.local_file_path = None;
            operations.push(Operation::Download {
                index,
                reason: DownloadReason::FileMissingOrInvalid,
            });
        }
    }

    for (index, old_position) in &diff.moved {
        operations.push(Operation::Move {
            index: *index,
            old_position: *old_position,
            new_position: playlist.tracks[*index].position,
        });
    }
    operations
}

/// Copy persisted status/paths from manifest entries onto the freshly
/// fetched playlist tracks (matched by source id, first occurrence wins).
fn seed_track_state(playlist: &mut Playlist, entries: &[ManifestEntry], _directory: &Path) {
    use std::collections::HashMap;
    let mut by_id: HashMap<&str, &ManifestEntry> = HashMap::new();
    for entry in entries {
        by_id.entry(entry.source_id.as_str()).or_insert(entry);
    }
    for track in &mut playlist.tracks {
        let Some(entry) = by_id.get(track.track.id.as_str()) else { continue };
        track.audio_status = entry.audio_status;
        track.lyrics_status = entry.lyrics_status;
        track.local_file_path = entry.local_file.clone();
        if let Some(lyrics_ref) = &entry.lyrics_ref {
            if lyrics_ref.ends_with(".txt") || lyrics_ref.ends_with(".lrc") {
                track.lyrics_file_path = Some(lyrics_ref.clone());
            } else {
                track.lyrics_source = Some(LyricsSource::parse(lyrics_ref));
            }
        }
    }
}

/// Merge run state into a freshly refetched playlist: match by source id,
/// preferring same-position matches so duplicated ids stay distinct.
fn merge_track_state(fresh: &mut Playlist, executed: &Playlist) {
    use std::collections::HashMap;
    let mut by_id: HashMap<&str, Vec<&PlaylistTrack>> = HashMap::new();
    for track in &executed.tracks {
        by_id.entry(track.track.id.as_str()).or_default().push(track);
    }
    let mut used: std::collections::HashSet<(String, u32)> = std::collections::HashSet::new();
    for track in &mut fresh.tracks {
        let Some(candidates) = by_id.get(track.track.id.as_str()) else { continue };
        let source = candidates
            .iter()
            .find(|c| c.position == track.position && !used.contains(&(c.track.id.clone(), c.position)))
            .or_else(|| {
                candidates.iter().find(|c| !used.contains(&(c.track.id.clone(), c.position)))
            });
        let Some(source) = source else { continue };
        used.insert((source.track.id.clone(), source.position));

        track.audio_status = source.audio_status;
        track.lyrics_status = source.lyrics_status;
        track.local_file_path = source.local_file_path.clone();
        track.lyrics_file_path = source.lyrics_file_path.clone();
        track.lyrics_source = source.lyrics_source;
        track.download_attempts = source.download_attempts;
        track.lyrics_attempts = source.lyrics_attempts;
        track.last_download_attempt = source.last_download_attempt;
        track.last_lyrics_attempt = source.last_lyrics_attempt;
        track.download_error = source.download_error.clone();
        track.lyrics_error = source.lyrics_error.clone();
        track.matched_video_id = source.matched_video_id.clone();
        track.match_score = source.match_score;
    }
}

/// Render the configured filename template for a track (no extension).
pub fn track_filename(naming: &NamingConfig, track: &PlaylistTrack) -> String {
    let (artist, title, album) = if naming.sanitize_filenames {
        (
            util::sanitize_filename(
                track.track.primary_artist(),
                naming.max_filename_length,
                false,
            ),
            util::sanitize_filename(&track.track.title, naming.max_filename_length, false),
            util::sanitize_filename(&track.track.album.name, naming.max_filename_length, false),
        )
    } else {
        (
            track.track.primary_artist().to_string(),
            track.track.title.clone(),
            track.track.album.name.clone(),
        )
    };
    let rendered = naming
        .track_format
        .replace("{track}", &format!("{:02}", track.position))
        .replace("{artist}", &artist)
        .replace("{title}", &title)
        .replace("{album}", &album);
    util::sanitize_filename(&rendered, naming.max_filename_length, naming.replace_spaces)
}

/// Plain-text per-run report under `<playlistDir>/logs/`.
fn write_run_report(directory: &Path, playlist: &Playlist, result: &SyncResult) -> Result<()> {
    let logs = directory.join("logs");
    std::fs::create_dir_all(&logs)?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = logs.join(format!("sync-{}.log", stamp));
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "Playlist: {} ({})", playlist.name, playlist.id)?;
    writeln!(file, "Result: {}", result.summary())?;
    writeln!(file)?;
    for track in &playlist.tracks {
        let mut line = format!(
            "{} {:02}. {} - {}",
            track.status_icons(),
            track.position,
            track.track.all_artists(),
            track.track.title
        );
        if let Some(err) = &track.download_error {
            line.push_str(&format!(" [audio: {}]", err));
        }
        if let Some(err) = &track.lyrics_error {
            line.push_str(&format!(" [lyrics: {}]", err));
        }
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Album, Artist, Track};

    fn sample_playlist(ids: &[(&str, &str)]) -> Playlist {
        let tracks = ids
            .iter()
            .enumerate()
            .map(|(i, (id, title))| {
                let track = Track {
                    id: id.to_string(),
                    title: title.to_string(),
                    artists: vec![Artist { id: "a".into(), name: "Artist".into() }],
                    album: Album {
                        id: "al".into(),
                        name: "Album".into(),
                        artists: vec![],
                        release_date: "2020-01-01".into(),
                        release_date_precision: "day".into(),
                        images: vec![],
                        genres: vec![],
                    },
                    duration_ms: 200_000,
                    explicit: false,
                    track_number: 1,
                    disc_number: 1,
                    isrc: None,
                    is_playable: true,
                };
                PlaylistTrack::new(track, (i + 1) as u32, None)
            })
            .collect();
        Playlist {
            id: "pl".into(),
            name: "My List".into(),
            description: String::new(),
            owner: "owner".into(),
            public: None,
            collaborative: None,
            snapshot_id: None,
            total_tracks: ids.len() as u32,
            tracks,
        }
    }

    fn entry(id: &str, pos: u32, title: &str, file: Option<&str>) -> ManifestEntry {
        ManifestEntry {
            position: pos,
            artists: "Artist".into(),
            title: title.into(),
            duration: "3:20".into(),
            source_id: id.into(),
            audio_status: AudioStatus::Downloaded,
            lyrics_status: LyricsStatus::Downloaded,
            local_file: file.map(String::from),
            lyrics_ref: None,
        }
    }

    #[test]
    fn incremental_plan_add_and_moves() {
        // Manifest has 5 entries; remote inserts a new track at position 3.
        let mut playlist = sample_playlist(&[
            ("id1", "One"),
            ("id2", "Two"),
            ("new", "Inserted"),
            ("id3", "Three"),
            ("id4", "Four"),
            ("id5", "Five"),
        ]);
        let entries = vec![
            entry("id1", 1, "One", Some("f1.m4a")),
            entry("id2", 2, "Two", Some("f2.m4a")),
            entry("id3", 3, "Three", Some("f3.m4a")),
            entry("id4", 4, "Four", Some("f4.m4a")),
            entry("id5", 5, "Five", Some("f5.m4a")),
        ];
        let dir = PathBuf::from("/tmp/x");
        let ops = build_incremental_ops(&mut playlist, &entries, &dir, true, &|_| true);

        let downloads: Vec<&Operation> = ops
            .iter()
            .filter(|op| matches!(op, Operation::Download { .. }))
            .collect();
        assert_eq!(downloads.len(), 1);
        assert!(matches!(
            downloads[0],
            Operation::Download { index: 2, reason: DownloadReason::TrackAdded }
        ));
        let moves: Vec<&Operation> =
            ops.iter().filter(|op| matches!(op, Operation::Move { .. })).collect();
        assert_eq!(moves.len(), 3);
        assert!(ops.contains(&Operation::Move { index: 3, old_position: 3, new_position: 4 }));
        assert!(ops.contains(&Operation::Move { index: 4, old_position: 4, new_position: 5 }));
        assert!(ops.contains(&Operation::Move { index: 5, old_position: 5, new_position: 6 }));
    }

    #[test]
    fn idempotent_when_nothing_changed() {
        let mut playlist = sample_playlist(&[("id1", "One"), ("id2", "Two")]);
        let entries = vec![
            entry("id1", 1, "One", Some("f1.m4a")),
            entry("id2", 2, "Two", Some("f2.m4a")),
        ];
        let ops =
            build_incremental_ops(&mut playlist, &entries, Path::new("/tmp/x"), true, &|_| true);
        assert!(ops.is_empty());
        assert_eq!(playlist.tracks[0].audio_status, AudioStatus::Downloaded);
    }

    #[test]
    fn invalid_file_triggers_redownload() {
        let mut playlist = sample_playlist(&[("id1", "One")]);
        let entries = vec![entry("id1", 1, "One", Some("gone.m4a"))];
        let ops =
            build_incremental_ops(&mut playlist, &entries, Path::new("/tmp/x"), true, &|_| false);
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            ops[0],
            Operation::Download { index: 0, reason: DownloadReason::FileMissingOrInvalid }
        ));
        assert_eq!(playlist.tracks[0].audio_status, AudioStatus::Pending);
    }

    #[test]
    fn filename_template_rendering() {
        let naming: NamingConfig = toml::from_str("").unwrap();
        let playlist = sample_playlist(&[("id1", "Song: Reprise?")]);
        let name = track_filename(&naming, &playlist.tracks[0]);
        assert_eq!(name, "01 - Artist - Song Reprise");
    }

    #[test]
    fn merge_preserves_state_for_duplicate_ids() {
        let mut fresh = sample_playlist(&[("dup", "Song"), ("dup", "Song")]);
        let mut executed = sample_playlist(&[("dup", "Song"), ("dup", "Song")]);
        executed.tracks[0].audio_status = AudioStatus::Downloaded;
        executed.tracks[0].local_file_path = Some("a.m4a".into());
        executed.tracks[1].audio_status = AudioStatus::Failed;
        executed.tracks[1].download_error = Some("boom".into());
        merge_track_state(&mut fresh, &executed);
        assert_eq!(fresh.tracks[0].audio_status, AudioStatus::Downloaded);
        assert_eq!(fresh.tracks[1].audio_status, AudioStatus::Failed);
        assert_eq!(fresh.tracks[1].download_error.as_deref(), Some("boom"));
    }
}
