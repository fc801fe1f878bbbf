//! Error types for the playback orchestrator.
//!
//! None of these are fatal: the control surface renders every variant as a
//! message in the conversation that caused it.

use thiserror::Error;

/// A raw query could not be turned into a playable track.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("No results for `{0}`")]
    NoResults(String),

    #[error("Metadata lookup failed: {0}")]
    Metadata(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The resolver pool was shut down while the request waited for a slot.
    #[error("Resolver pool is closed")]
    PoolClosed,
}

/// Failure reported by the streaming collaborator.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StreamError(pub String);

impl StreamError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The streaming collaborator refused to start or switch to a track.
#[derive(Debug, Clone, Error)]
#[error("Could not start `{title}`: {source}")]
pub struct PlaybackStartError {
    pub title: String,
    #[source]
    pub source: StreamError,
}

/// A command that makes no sense for the session's current content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidCommandError {
    #[error("Provide a song name or link")]
    EmptyQuery,

    #[error("Nothing is playing")]
    NothingPlaying,

    #[error("Playback is already paused")]
    AlreadyPaused,

    #[error("Playback is not paused")]
    NotPaused,

    #[error("This command only works in a guild")]
    NotInGuild,

    #[error("Join a voice channel first")]
    NoVoiceChannel,
}

#[derive(Debug, Error)]
pub enum MusicError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    PlaybackStart(#[from] PlaybackStartError),

    #[error(transparent)]
    InvalidCommand(#[from] InvalidCommandError),

    /// Pause/resume/release failed on the streaming side; session state is unchanged.
    #[error("Voice error: {0}")]
    Stream(#[from] StreamError),
}

pub type Result<T> = std::result::Result<T, MusicError>;
