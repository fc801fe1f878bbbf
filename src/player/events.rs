//! Notifications leaving the orchestrator for the control surface.

use crate::error::PlaybackStartError;
use crate::player::track::{ConversationId, TrackArtifact, TrackId};

#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// A track became current and the streamer accepted it.
    NowPlaying {
        conversation: ConversationId,
        track: TrackArtifact,
        /// Tracks waiting behind it at that moment.
        queued: usize,
    },

    /// The streamer rejected a track; it was dropped and playback moved on.
    PlaybackFailed {
        conversation: ConversationId,
        error: PlaybackStartError,
    },

    /// The last track finished and nothing was queued behind it.
    QueueFinished { conversation: ConversationId },
}

/// Inbound signals from the streaming collaborator.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    /// Also sent for tracks that were stopped by a skip, so the id is checked
    /// against the session's current track before advancing.
    TrackEnded {
        conversation: ConversationId,
        track: TrackId,
    },
}
