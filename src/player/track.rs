use std::fmt;
use std::path::{Path, PathBuf};

/// Scoping unit of one independent playback queue (a guild on Discord).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub u64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackId(pub String);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-owning reference to a downloaded file in the resolver's storage area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef(pub PathBuf);

impl MediaRef {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// What the resolver hands back before a requester is attached.
#[derive(Debug, Clone)]
pub struct ResolvedTrack {
    pub id: TrackId,
    pub title: String,
    pub duration_secs: u64,
    pub media: MediaRef,
    pub thumbnail: Option<String>,
}

/// A resolved, playable representation of one play request.
#[derive(Debug, Clone)]
pub struct TrackArtifact {
    pub id: TrackId,
    pub title: String,
    /// 0 means unknown
    pub duration_secs: u64,
    pub media: MediaRef,
    pub requested_by: String,
    /// Raw query this track was resolved from, kept so playlists can re-resolve it.
    pub query: String,
    pub thumbnail: Option<String>,
}

impl TrackArtifact {
    pub fn from_resolved(resolved: ResolvedTrack, query: &str, requested_by: &str) -> Self {
        Self {
            id: resolved.id,
            title: resolved.title,
            duration_secs: resolved.duration_secs,
            media: resolved.media,
            requested_by: requested_by.to_string(),
            query: query.to_string(),
            thumbnail: resolved.thumbnail,
        }
    }

    pub fn display_duration(&self) -> String {
        format_duration(self.duration_secs)
    }
}

/// `mm:ss`, or `hh:mm:ss` past an hour. Unknown (0) renders as `?`.
pub fn format_duration(seconds: u64) -> String {
    if seconds == 0 {
        return "?".to_string();
    }
    let (m, s) = (seconds / 60, seconds % 60);
    let (h, m) = (m / 60, m % 60);
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
