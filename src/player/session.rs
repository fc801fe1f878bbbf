//! Per-conversation playback state.
//!
//! Every mutator keeps `current.is_some() == (state != Idle)` and never lets
//! the current track sit in `queue`. Callers reach a `Session` only through
//! the registry's lock, which is what serializes transitions per conversation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{ResolutionError, Result};
use crate::player::admission::Admission;
use crate::player::track::{ConversationId, ResolvedTrack, TrackArtifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// A play request that has been ticketed but not yet admitted.
pub(crate) struct PendingAdmission {
    pub ticket: u64,
    pub query: String,
    pub requested_by: String,
    pub outcome: Option<std::result::Result<ResolvedTrack, ResolutionError>>,
    pub reply: oneshot::Sender<Result<Admission>>,
}

pub struct Session {
    conversation: ConversationId,
    state: PlaybackState,
    queue: VecDeque<TrackArtifact>,
    current: Option<TrackArtifact>,
    /// Ordered by ticket, i.e. by submission order.
    pending: VecDeque<PendingAdmission>,
    last_activity: Instant,
    retired: bool,
}

impl Session {
    pub fn new(conversation: ConversationId) -> Self {
        Self {
            conversation,
            state: PlaybackState::Idle,
            queue: VecDeque::new(),
            current: None,
            pending: VecDeque::new(),
            last_activity: Instant::now(),
            retired: false,
        }
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current(&self) -> Option<&TrackArtifact> {
        self.current.as_ref()
    }

    pub fn queue(&self) -> &VecDeque<TrackArtifact> {
        &self.queue
    }

    /// True while a submitted request is resolving or waiting behind an earlier one.
    pub fn admission_in_flight(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn begin(&mut self, track: TrackArtifact) {
        self.current = Some(track);
        self.state = PlaybackState::Playing;
        self.touch();
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        if self.current.is_some() {
            self.state = if paused {
                PlaybackState::Paused
            } else {
                PlaybackState::Playing
            };
            self.touch();
        }
    }

    pub(crate) fn clear_current(&mut self) -> Option<TrackArtifact> {
        self.state = PlaybackState::Idle;
        self.touch();
        self.current.take()
    }

    /// Returns the 1-based queue position of the appended track.
    pub(crate) fn enqueue(&mut self, track: TrackArtifact) -> usize {
        self.queue.push_back(track);
        self.touch();
        self.queue.len()
    }

    pub(crate) fn pop_next(&mut self) -> Option<TrackArtifact> {
        self.queue.pop_front()
    }

    pub(crate) fn clear_queue(&mut self) -> usize {
        let cleared = self.queue.len();
        self.queue.clear();
        self.touch();
        cleared
    }

    pub(crate) fn open_ticket(
        &mut self,
        ticket: u64,
        query: &str,
        requested_by: &str,
        reply: oneshot::Sender<Result<Admission>>,
    ) {
        self.pending.push_back(PendingAdmission {
            ticket,
            query: query.to_string(),
            requested_by: requested_by.to_string(),
            outcome: None,
            reply,
        });
        self.touch();
    }

    /// Stores a resolution result. Returns false when the ticket is no longer
    /// pending, which means a stop discarded it.
    pub(crate) fn fill_ticket(
        &mut self,
        ticket: u64,
        outcome: std::result::Result<ResolvedTrack, ResolutionError>,
    ) -> bool {
        match self.pending.iter_mut().find(|p| p.ticket == ticket) {
            Some(slot) => {
                slot.outcome = Some(outcome);
                true
            }
            None => false,
        }
    }

    /// Pops the oldest pending admission if its resolution has completed.
    pub(crate) fn take_ready(
        &mut self,
    ) -> Option<(PendingAdmission, std::result::Result<ResolvedTrack, ResolutionError>)> {
        self.pending.front()?.outcome.as_ref()?;
        let mut ready = self.pending.pop_front()?;
        let outcome = ready.outcome.take()?;
        Some((ready, outcome))
    }

    pub(crate) fn cancel_pending(&mut self) -> Vec<PendingAdmission> {
        self.pending.drain(..).collect()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn is_reapable(&self, max_idle: Duration) -> bool {
        self.state == PlaybackState::Idle
            && self.queue.is_empty()
            && self.pending.is_empty()
            && self.last_activity.elapsed() >= max_idle
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        assert_eq!(
            self.current.is_none(),
            self.state == PlaybackState::Idle,
            "current/state mismatch in {}",
            self.conversation
        );
        if let Some(current) = &self.current {
            assert!(
                self.queue.iter().all(|t| t.id != current.id),
                "current track is also queued"
            );
        }
    }
}
