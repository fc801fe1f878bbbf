//! State transitions of a single session.
//!
//! Every method takes the session by `&mut`, so callers must already hold the
//! session's lock; that lock is kept across the streamer calls made here.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{InvalidCommandError, PlaybackStartError, Result};
use crate::player::events::PlaybackEvent;
use crate::player::gateway::Streamer;
use crate::player::session::{PlaybackState, Session};
use crate::player::track::TrackArtifact;

pub struct Advancer {
    streamer: Arc<dyn Streamer>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Advancer {
    pub fn new(streamer: Arc<dyn Streamer>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self { streamer, events }
    }

    /// Idle -> Playing for a freshly admitted track.
    ///
    /// If the streamer refuses it, the track is dropped, the session settles
    /// back to Idle (releasing voice) and the error is returned to the caller.
    pub async fn start(
        &self,
        session: &mut Session,
        track: TrackArtifact,
    ) -> std::result::Result<(), PlaybackStartError> {
        debug_assert_eq!(session.state(), PlaybackState::Idle);
        match self.switch_to(session, track).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.advance(session).await;
                Err(err)
            }
        }
    }

    /// Moves to the next queued track, or to Idle when the queue is empty.
    ///
    /// Tracks the streamer rejects are reported and skipped. Returns the new
    /// current track, if any.
    pub async fn advance(&self, session: &mut Session) -> Option<TrackArtifact> {
        let finished = session.clear_current();
        while let Some(next) = session.pop_next() {
            if self.switch_to(session, next).await.is_ok() {
                return session.current().cloned();
            }
        }

        self.release(session).await;
        if finished.is_some() {
            self.emit(PlaybackEvent::QueueFinished {
                conversation: session.conversation(),
            });
        }
        None
    }

    /// Explicit skip. Works from Playing and Paused alike.
    pub async fn skip(&self, session: &mut Session) -> Result<Option<TrackArtifact>> {
        if session.state() == PlaybackState::Idle {
            return Err(InvalidCommandError::NothingPlaying.into());
        }
        Ok(self.advance(session).await)
    }

    pub async fn pause(&self, session: &mut Session) -> Result<TrackArtifact> {
        let track = match (session.state(), session.current()) {
            (PlaybackState::Playing, Some(track)) => track.clone(),
            (PlaybackState::Paused, _) => return Err(InvalidCommandError::AlreadyPaused.into()),
            _ => return Err(InvalidCommandError::NothingPlaying.into()),
        };
        self.streamer.pause(session.conversation()).await?;
        session.set_paused(true);
        info!(conversation = %session.conversation(), title = %track.title, "paused");
        Ok(track)
    }

    /// Continues the same current track; never pops the queue.
    pub async fn resume(&self, session: &mut Session) -> Result<TrackArtifact> {
        let track = match (session.state(), session.current()) {
            (PlaybackState::Paused, Some(track)) => track.clone(),
            (PlaybackState::Playing, _) => return Err(InvalidCommandError::NotPaused.into()),
            _ => return Err(InvalidCommandError::NothingPlaying.into()),
        };
        self.streamer.resume(session.conversation()).await?;
        session.set_paused(false);
        info!(conversation = %session.conversation(), title = %track.title, "resumed");
        Ok(track)
    }

    /// Clears the queue and goes Idle from any state. Returns how many queued
    /// tracks were dropped.
    pub async fn stop(&self, session: &mut Session) -> usize {
        let cleared = session.clear_queue();
        let stopped = session.clear_current();
        self.release(session).await;
        info!(
            conversation = %session.conversation(),
            cleared,
            was_playing = stopped.is_some(),
            "stopped"
        );
        cleared
    }

    async fn switch_to(
        &self,
        session: &mut Session,
        track: TrackArtifact,
    ) -> std::result::Result<(), PlaybackStartError> {
        let conversation = session.conversation();
        match self.streamer.start_or_switch(conversation, &track).await {
            Ok(()) => {
                info!(%conversation, title = %track.title, id = %track.id, "now playing");
                session.begin(track.clone());
                self.emit(PlaybackEvent::NowPlaying {
                    conversation,
                    track,
                    queued: session.queue().len(),
                });
                Ok(())
            }
            Err(source) => {
                warn!(%conversation, title = %track.title, error = %source, "streamer rejected track");
                let error = PlaybackStartError {
                    title: track.title,
                    source,
                };
                self.emit(PlaybackEvent::PlaybackFailed {
                    conversation,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn release(&self, session: &Session) {
        if let Err(e) = self.streamer.release(session.conversation()).await {
            warn!(conversation = %session.conversation(), error = %e, "failed to release voice");
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        if self.events.send(event).is_err() {
            debug!("playback event receiver dropped");
        }
    }
}
