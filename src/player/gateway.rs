//! Boundaries to the collaborators the orchestrator drives but does not own.

use async_trait::async_trait;

use crate::error::{ResolutionError, StreamError};
use crate::player::track::{ConversationId, ResolvedTrack, TrackArtifact};

/// Turns a raw query or link into a downloaded, playable track.
///
/// Calls may be slow; the orchestrator only invokes this from its bounded
/// resolver pool.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolutionError>;
}

/// Rewrites a streaming-service link into plain search terms.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    fn matches(&self, query: &str) -> bool;

    async fn search_terms(&self, link: &str) -> Result<String, ResolutionError>;
}

/// Transports audio into a conversation's live voice connection.
#[async_trait]
pub trait Streamer: Send + Sync {
    async fn start_or_switch(
        &self,
        conversation: ConversationId,
        track: &TrackArtifact,
    ) -> Result<(), StreamError>;

    async fn pause(&self, conversation: ConversationId) -> Result<(), StreamError>;

    async fn resume(&self, conversation: ConversationId) -> Result<(), StreamError>;

    /// Frees the conversation's voice resources.
    async fn release(&self, conversation: ConversationId) -> Result<(), StreamError>;
}
