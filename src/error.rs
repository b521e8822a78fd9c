use thiserror::Error;

/// Error taxonomy for the sync pipeline.
///
/// Critical kinds (config, manifest, auth) abort a run; per-track kinds are
/// recorded on the affected track and the run continues; tagger/lyrics
/// failures downgrade a track to partial success without failing it.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("config error: {0}")]
    Config(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("source catalog error: {message}")]
    SourceCatalog { message: String, transient: bool },

    #[error("no match found: {0}")]
    Resolver(String),

    #[error("download error: {0}")]
    Download(String),

    #[error("tagging error: {0}")]
    Tagger(String),

    #[error("lyrics error: {0}")]
    Lyrics(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn source_transient(message: impl Into<String>) -> Self {
        SyncError::SourceCatalog { message: message.into(), transient: true }
    }

    pub fn source_permanent(message: impl Into<String>) -> Self {
        SyncError::SourceCatalog { message: message.into(), transient: false }
    }

    /// Critical errors abort the whole sync run.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_) | SyncError::Manifest(_) | SyncError::Auth(_)
        )
    }

    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::SourceCatalog { transient, .. } => *transient,
            SyncError::Http(e) => e.is_timeout() || e.is_connect(),
            SyncError::Io(_) => false,
            _ => false,
        }
    }

    /// Non-fatal kinds leave the track downloaded but partially enriched.
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, SyncError::Tagger(_) | SyncError::Lyrics(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
