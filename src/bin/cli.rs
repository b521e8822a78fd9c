use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::rolling::RollingFileAppender;

use music_playlist_offline_sync as lib;
use lib::config::Config;
use lib::sync::SyncContext;

#[derive(Parser)]
#[command(name = "music-playlist-offline-sync", version)]
struct Cli {
    /// Path to config TOML (defaults apply when omitted)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store source-platform credentials and mint a token
    Login(LoginArgs),
    /// Remove stored credentials
    Logout,
    /// Show auth status
    Status,
    /// Download a playlist (full sync of a fresh or existing directory)
    Download {
        /// Playlist id, URL or URI
        reference: String,
        /// Override the playlist directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Incrementally sync a playlist
    Sync { reference: String },
    /// Show what a sync would do without doing it
    Check { reference: String },
    /// List locally mirrored playlists
    List,
    /// Lyrics operations
    Lyrics {
        #[command(subcommand)]
        sub: LyricsCommands,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        sub: ConfigCommands,
    },
    /// Check external tools and local state
    Doctor,
}

#[derive(Subcommand)]
enum LyricsCommands {
    /// Fetch lyrics for already-downloaded tracks of a playlist
    Download { reference: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Set a config value (key is section.field)
    Set { key: String, value: String },
}

#[derive(Args)]
struct LoginArgs {
    #[arg(long)]
    client_id: String,
    #[arg(long)]
    client_secret: String,
    /// Refresh token obtained out of band, for user-scoped playlists
    #[arg(long)]
    refresh_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load_or_default(cli.config.as_deref())?;

    // Structured logging to a daily rolling file; keep the guard alive so
    // the non-blocking writer flushes on exit.
    std::fs::create_dir_all(&cfg.log_dir).ok();
    let file_appender: RollingFileAppender =
        tracing_appender::rolling::daily(&cfg.log_dir, "playlist-sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_log::LogTracer::init().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "logging initialized");

    let exit_code = run(cli, cfg).await?;
    // Flush the non-blocking writer before exiting.
    drop(guard);
    std::process::exit(exit_code);
}

async fn run(cli: Cli, cfg: Config) -> Result<i32> {
    match cli.command {
        Commands::Login(args) => {
            std::env::set_var("SOURCE_CLIENT_ID", &args.client_id);
            std::env::set_var("SOURCE_CLIENT_SECRET", &args.client_secret);
            let ctx = SyncContext::new(cfg)?;
            ctx.auth.login(args.refresh_token).await?;
            println!("Logged in.");
            Ok(0)
        }
        Commands::Logout => {
            let ctx = SyncContext::new(cfg)?;
            ctx.auth.logout().await?;
            println!("Logged out.");
            Ok(0)
        }
        Commands::Status => {
            let ctx = SyncContext::new(cfg)?;
            if ctx.auth.has_stored_token().await {
                println!("Authenticated (stored token present).");
            } else {
                println!("Not authenticated. Run `login` first.");
            }
            Ok(0)
        }
        Commands::Download { reference, output } => {
            let ctx = install_interrupt(SyncContext::new(cfg)?);
            let result = ctx.sync_playlist(&reference, output).await?;
            println!("{}", result.summary());
            Ok(exit_code_for(&ctx, result.success))
        }
        Commands::Sync { reference } => {
            let ctx = install_interrupt(SyncContext::new(cfg)?);
            let result = ctx.sync_playlist(&reference, None).await?;
            println!("{}", result.summary());
            Ok(exit_code_for(&ctx, result.success))
        }
        Commands::Check { reference } => {
            let ctx = SyncContext::new(cfg)?;
            let plan = ctx.check_playlist(&reference, None).await?;
            if plan.has_changes() {
                println!(
                    "'{}' needs sync: {} downloads, {} moves -> {}",
                    plan.playlist_name,
                    plan.download_count(),
                    plan.move_count(),
                    plan.directory.display()
                );
            } else {
                println!("'{}' is up to date.", plan.playlist_name);
            }
            Ok(0)
        }
        Commands::List => {
            let root = cfg.output_root();
            let manifests = lib::manifest::find_manifests(&root);
            if manifests.is_empty() {
                println!("No mirrored playlists under {}", root.display());
                return Ok(0);
            }
            for path in manifests {
                match lib::manifest::read(&path) {
                    Ok((header, entries)) => {
                        let downloaded = entries
                            .iter()
                            .filter(|e| {
                                e.audio_status == lib::models::AudioStatus::Downloaded
                            })
                            .count();
                        println!(
                            "{} [{}] {}/{} downloaded ({})",
                            header.playlist_name,
                            header.source_id,
                            downloaded,
                            entries.len(),
                            path.parent().unwrap_or(&root).display()
                        );
                    }
                    Err(e) => eprintln!("{}: unreadable manifest ({})", path.display(), e),
                }
            }
            Ok(0)
        }
        Commands::Lyrics { sub } => match sub {
            LyricsCommands::Download { reference } => {
                let ctx = install_interrupt(SyncContext::new(cfg)?);
                let (completed, failed) = ctx.sync_lyrics_only(&reference).await?;
                println!("{} lyrics downloaded, {} missing", completed, failed);
                Ok(exit_code_for(&ctx, true))
            }
        },
        Commands::Config { sub } => match sub {
            ConfigCommands::Show => {
                println!("{:#?}", cfg);
                Ok(0)
            }
            ConfigCommands::Set { key, value } => {
                let path = cli
                    .config
                    .ok_or_else(|| anyhow::anyhow!("--config is required for `config set`"))?;
                config_set(&path, &key, &value)?;
                println!("Set {} = {}", key, value);
                Ok(0)
            }
        },
        Commands::Doctor => {
            doctor(&cfg).await;
            Ok(0)
        }
    }
}

fn install_interrupt(ctx: SyncContext) -> SyncContext {
    let token = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; finishing up and writing manifest...");
            token.cancel();
        }
    });
    ctx
}

fn exit_code_for(ctx: &SyncContext, success: bool) -> i32 {
    if ctx.cancel.is_cancelled() {
        130
    } else if success {
        0
    } else {
        1
    }
}

/// Set `section.field` in the TOML config file, creating it if needed.
fn config_set(path: &std::path::Path, key: &str, value: &str) -> Result<()> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let mut doc: toml::Value = toml::from_str(&content).unwrap_or(toml::Value::Table(
        toml::value::Table::new(),
    ));

    let (section, field) = key
        .split_once('.')
        .ok_or_else(|| anyhow::anyhow!("key must be section.field, e.g. output.format"))?;
    let parsed: toml::Value = if let Ok(b) = value.parse::<bool>() {
        toml::Value::Boolean(b)
    } else if let Ok(n) = value.parse::<i64>() {
        toml::Value::Integer(n)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    };

    let table = doc
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("config root is not a table"))?;
    let section_value = table
        .entry(section.to_string())
        .or_insert(toml::Value::Table(toml::value::Table::new()));
    section_value
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("{} is not a table", section))?
        .insert(field.to_string(), parsed);

    // Validate the result before writing it back.
    let serialized = toml::to_string_pretty(&doc)?;
    let _: Config = toml::from_str(&serialized)?;
    std::fs::write(path, serialized)?;
    Ok(())
}

async fn doctor(cfg: &Config) {
    let check = |name: &str, ok: bool, detail: String| {
        println!("{} {:12} {}", if ok { "✅" } else { "❌" }, name, detail);
    };

    let ytdlp = tokio::process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
    check(
        "yt-dlp",
        ytdlp.is_some(),
        ytdlp.unwrap_or_else(|| "not found (required for downloads)".into()),
    );

    let ffmpeg = tokio::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
        .ok()
        .filter(|o| o.status.success())
        .map(|o| {
            String::from_utf8_lossy(&o.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .to_string()
        });
    check(
        "ffmpeg",
        ffmpeg.is_some(),
        ffmpeg.unwrap_or_else(|| "not found (audio processing disabled)".into()),
    );

    let root = cfg.output_root();
    let root_ok = std::fs::create_dir_all(&root).is_ok();
    check("output root", root_ok, root.display().to_string());

    let db_ok = lib::db::open_or_create(&cfg.db_path).is_ok();
    check("state db", db_ok, cfg.db_path.display().to_string());

    let creds = Config::source_client_credentials();
    check(
        "credentials",
        !creds.0.is_empty(),
        if creds.0.is_empty() {
            "SOURCE_CLIENT_ID / SOURCE_CLIENT_SECRET not set".into()
        } else {
            "client id configured".into()
        },
    );

    for path in lib::manifest::find_manifests(&root) {
        match lib::manifest::validate(&path) {
            Ok(issues) if issues.is_empty() => {
                check("manifest", true, path.display().to_string())
            }
            Ok(issues) => check(
                "manifest",
                false,
                format!("{}: {}", path.display(), issues.join("; ")),
            ),
            Err(e) => check("manifest", false, format!("{}: {}", path.display(), e)),
        }
    }
}
