//! Playback session orchestrator.
//!
//! One `Session` per conversation, a registry that hands out exclusive access
//! to them, an advancer that drives the Idle/Playing/Paused state machine, and
//! an admission path that turns raw queries into queued tracks. Everything the
//! control surface does goes through [`Orchestrator`].

pub mod admission;
pub mod advancer;
pub mod events;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod track;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info};

use crate::error::Result;

pub use admission::Admission;
pub use events::{PlaybackEvent, StreamSignal};
pub use gateway::{MetadataLookup, Resolver, Streamer};
pub use session::PlaybackState;
pub use track::{ConversationId, MediaRef, ResolvedTrack, TrackArtifact, TrackId};

use advancer::Advancer;
use registry::SessionRegistry;

/// Snapshot of what a conversation is playing.
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub track: TrackArtifact,
    pub state: PlaybackState,
    pub queued: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: SessionRegistry,
    resolver: Arc<dyn Resolver>,
    advancer: Advancer,
    pool: Semaphore,
    tickets: AtomicU64,
}

impl Orchestrator {
    /// `workers` bounds how many resolutions run at once across all conversations.
    pub fn new(
        resolver: Arc<dyn Resolver>,
        streamer: Arc<dyn Streamer>,
        workers: usize,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let orchestrator = Self {
            inner: Arc::new(Inner {
                registry: SessionRegistry::new(),
                resolver,
                advancer: Advancer::new(streamer, events),
                pool: Semaphore::new(workers.max(1)),
                tickets: AtomicU64::new(0),
            }),
        };
        (orchestrator, receiver)
    }

    pub async fn skip(&self, conversation: ConversationId) -> Result<Option<TrackArtifact>> {
        let mut session = self.inner.registry.lock(conversation).await;
        self.inner.advancer.skip(&mut session).await
    }

    pub async fn pause(&self, conversation: ConversationId) -> Result<TrackArtifact> {
        let mut session = self.inner.registry.lock(conversation).await;
        self.inner.advancer.pause(&mut session).await
    }

    pub async fn resume(&self, conversation: ConversationId) -> Result<TrackArtifact> {
        let mut session = self.inner.registry.lock(conversation).await;
        self.inner.advancer.resume(&mut session).await
    }

    /// Empties the queue, discards in-flight requests and goes Idle.
    /// Returns how many queued tracks were dropped.
    pub async fn stop(&self, conversation: ConversationId) -> usize {
        let mut session = self.inner.registry.lock(conversation).await;
        for pending in session.cancel_pending() {
            debug!(%conversation, ticket = pending.ticket, "discarding in-flight request");
            let _ = pending.reply.send(Ok(Admission::Discarded));
        }
        self.inner.advancer.stop(&mut session).await
    }

    /// Same transition as a skip, but only if `track` is still the current one.
    /// Returns whether the session advanced.
    pub async fn track_ended(&self, conversation: ConversationId, track: &TrackId) -> bool {
        let mut session = self.inner.registry.lock(conversation).await;
        if session.current().map(|t| &t.id) != Some(track) {
            debug!(%conversation, %track, "ignoring end of a track that is no longer current");
            return false;
        }
        self.inner.advancer.advance(&mut session).await;
        true
    }

    pub async fn queue(&self, conversation: ConversationId) -> Vec<TrackArtifact> {
        let session = self.inner.registry.lock(conversation).await;
        session.queue().iter().cloned().collect()
    }

    pub async fn now_playing(&self, conversation: ConversationId) -> Option<NowPlaying> {
        let session = self.inner.registry.lock(conversation).await;
        session.current().map(|track| NowPlaying {
            track: track.clone(),
            state: session.state(),
            queued: session.queue().len(),
        })
    }

    /// Removes sessions idle and empty for at least `max_idle`.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<ConversationId> {
        let reaped = self.inner.registry.reap_idle(max_idle).await;
        if !reaped.is_empty() {
            info!(reaped = reaped.len(), "reaped idle sessions");
        }
        reaped
    }

    pub async fn session_count(&self) -> usize {
        self.inner.registry.len().await
    }

    #[cfg(test)]
    async fn assert_invariants(&self, conversation: ConversationId) {
        self.inner.registry.lock(conversation).await.assert_invariants();
    }

    #[cfg(test)]
    async fn admission_in_flight(&self, conversation: ConversationId) -> bool {
        self.inner.registry.lock(conversation).await.admission_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Call, RecordingStreamer, ScriptedResolver, drain_events, wait_until};
    use super::*;
    use crate::error::{InvalidCommandError, MusicError, ResolutionError};

    const CHAT: ConversationId = ConversationId(1);

    fn setup(
        resolver: &Arc<ScriptedResolver>,
        streamer: &Arc<RecordingStreamer>,
    ) -> (Orchestrator, mpsc::UnboundedReceiver<PlaybackEvent>) {
        Orchestrator::new(resolver.clone(), streamer.clone(), 4)
    }

    fn titles(tracks: &[TrackArtifact]) -> Vec<String> {
        tracks.iter().map(|t| t.title.clone()).collect()
    }

    #[tokio::test]
    async fn walkthrough_from_empty_to_idle() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, mut events) = setup(&resolver, &streamer);

        let a = orch.submit_play(CHAT, "A", "alice").await.unwrap();
        assert!(matches!(a, Admission::Started(ref t) if t.title == "A"));
        let np = orch.now_playing(CHAT).await.unwrap();
        assert_eq!(np.track.title, "A");
        assert_eq!(np.state, PlaybackState::Playing);
        assert!(orch.queue(CHAT).await.is_empty());

        let b = orch.submit_play(CHAT, "B", "bob").await.unwrap();
        assert!(matches!(b, Admission::Queued { ref track, position: 1 } if track.title == "B"));
        assert_eq!(orch.now_playing(CHAT).await.unwrap().track.title, "A");
        assert_eq!(titles(&orch.queue(CHAT).await), ["B"]);

        let a_id = orch.now_playing(CHAT).await.unwrap().track.id;
        assert!(orch.track_ended(CHAT, &a_id).await);
        assert_eq!(orch.now_playing(CHAT).await.unwrap().track.title, "B");
        assert!(orch.queue(CHAT).await.is_empty());

        let b_id = orch.now_playing(CHAT).await.unwrap().track.id;
        assert!(orch.track_ended(CHAT, &b_id).await);
        assert!(orch.now_playing(CHAT).await.is_none());
        orch.assert_invariants(CHAT).await;
        assert_eq!(streamer.count(|c| matches!(c, Call::Release(_))), 1);

        let events = drain_events(&mut events);
        assert!(matches!(events.last(), Some(PlaybackEvent::QueueFinished { .. })));
        let started: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PlaybackEvent::NowPlaying { track, .. } => Some(track.title.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(started, ["A", "B"]);
    }

    #[tokio::test]
    async fn queue_follows_submission_order_when_resolutions_finish_out_of_order() {
        let resolver = ScriptedResolver::gated();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { orch.submit_play(CHAT, "first", "u").await }
        });
        wait_until(|| resolver.started("first")).await;
        let mut rest = Vec::new();
        for q in ["second", "third", "fourth"] {
            rest.push(tokio::spawn({
                let orch = orch.clone();
                async move { orch.submit_play(CHAT, q, "u").await }
            }));
            wait_until(|| resolver.started(q)).await;
        }

        resolver.release("fourth");
        resolver.release("second");
        resolver.release("third");
        tokio::task::yield_now().await;
        assert!(orch.admission_in_flight(CHAT).await);
        assert!(orch.now_playing(CHAT).await.is_none());

        resolver.release("first");
        assert!(matches!(first.await.unwrap().unwrap(), Admission::Started(_)));
        for (i, task) in rest.into_iter().enumerate() {
            match task.await.unwrap().unwrap() {
                Admission::Queued { position, .. } => assert_eq!(position, i + 1),
                other => panic!("expected queued, got {other:?}"),
            }
        }

        assert_eq!(orch.now_playing(CHAT).await.unwrap().track.title, "first");
        assert_eq!(titles(&orch.queue(CHAT).await), ["second", "third", "fourth"]);
        assert!(!orch.admission_in_flight(CHAT).await);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test]
    async fn batch_keeps_order_and_skips_blank_queries() {
        let resolver = ScriptedResolver::instant();
        resolver.fail("missing");
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        let outcomes = orch
            .submit_batch(CHAT, &["one", " ", "missing", "two", "three"], "u")
            .await;

        assert_eq!(outcomes.len(), 4);
        assert!(matches!(outcomes[0], Ok(Admission::Started(_))));
        assert!(matches!(outcomes[1], Err(MusicError::Resolution(_))));
        assert!(matches!(outcomes[3], Ok(Admission::Queued { position: 2, .. })));
        assert_eq!(titles(&orch.queue(CHAT).await), ["two", "three"]);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_start_exactly_once() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        let (x, y) = tokio::join!(
            orch.submit_play(CHAT, "x", "u1"),
            orch.submit_play(CHAT, "y", "u2"),
        );
        let outcomes = [x.unwrap(), y.unwrap()];

        let started = outcomes.iter().filter(|a| matches!(a, Admission::Started(_))).count();
        let queued = outcomes.iter().filter(|a| matches!(a, Admission::Queued { .. })).count();
        assert_eq!((started, queued), (1, 1));
        assert_eq!(streamer.count(|c| matches!(c, Call::Start(..))), 1);
        assert_eq!(orch.queue(CHAT).await.len(), 1);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test]
    async fn skip_on_last_track_goes_idle_and_releases_once() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        orch.submit_play(CHAT, "only", "u").await.unwrap();
        assert!(orch.skip(CHAT).await.unwrap().is_none());

        assert!(orch.now_playing(CHAT).await.is_none());
        assert_eq!(streamer.count(|c| matches!(c, Call::Release(_))), 1);
        orch.assert_invariants(CHAT).await;

        let err = orch.skip(CHAT).await.unwrap_err();
        assert!(matches!(err, MusicError::InvalidCommand(InvalidCommandError::NothingPlaying)));
        assert_eq!(streamer.count(|c| matches!(c, Call::Release(_))), 1);
    }

    #[tokio::test]
    async fn skip_while_paused_moves_to_next_track() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        orch.submit_play(CHAT, "one", "u").await.unwrap();
        orch.submit_play(CHAT, "two", "u").await.unwrap();
        orch.pause(CHAT).await.unwrap();

        let next = orch.skip(CHAT).await.unwrap().unwrap();
        assert_eq!(next.title, "two");
        assert_eq!(orch.now_playing(CHAT).await.unwrap().state, PlaybackState::Playing);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test]
    async fn pause_and_resume_keep_the_same_track() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        assert!(matches!(
            orch.pause(CHAT).await,
            Err(MusicError::InvalidCommand(InvalidCommandError::NothingPlaying))
        ));

        orch.submit_play(CHAT, "song", "u").await.unwrap();
        orch.submit_play(CHAT, "next", "u").await.unwrap();
        orch.pause(CHAT).await.unwrap();
        assert_eq!(orch.now_playing(CHAT).await.unwrap().state, PlaybackState::Paused);
        assert!(matches!(
            orch.pause(CHAT).await,
            Err(MusicError::InvalidCommand(InvalidCommandError::AlreadyPaused))
        ));

        let resumed = orch.resume(CHAT).await.unwrap();
        assert_eq!(resumed.title, "song");
        assert_eq!(titles(&orch.queue(CHAT).await), ["next"]);
        assert!(matches!(
            orch.resume(CHAT).await,
            Err(MusicError::InvalidCommand(InvalidCommandError::NotPaused))
        ));
        assert_eq!(streamer.count(|c| matches!(c, Call::Pause(_))), 1);
        assert_eq!(streamer.count(|c| matches!(c, Call::Resume(_))), 1);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test]
    async fn failed_pause_leaves_state_untouched() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        orch.submit_play(CHAT, "song", "u").await.unwrap();
        streamer.fail_controls(true);
        assert!(matches!(orch.pause(CHAT).await, Err(MusicError::Stream(_))));
        assert_eq!(orch.now_playing(CHAT).await.unwrap().state, PlaybackState::Playing);
    }

    #[tokio::test]
    async fn stop_clears_queue_and_discards_in_flight_resolutions() {
        let resolver = ScriptedResolver::gated();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        resolver.open("a");
        resolver.open("b");
        orch.submit_play(CHAT, "a", "u").await.unwrap();
        orch.submit_play(CHAT, "b", "u").await.unwrap();

        let late = tokio::spawn({
            let orch = orch.clone();
            async move { orch.submit_play(CHAT, "late", "u").await }
        });
        wait_until(|| resolver.started("late")).await;

        assert_eq!(orch.stop(CHAT).await, 1);
        assert!(matches!(late.await.unwrap().unwrap(), Admission::Discarded));
        assert!(!orch.admission_in_flight(CHAT).await);

        resolver.release("late");
        wait_until(|| resolver.finished("late")).await;
        tokio::task::yield_now().await;

        assert!(orch.queue(CHAT).await.is_empty());
        assert!(orch.now_playing(CHAT).await.is_none());
        assert_eq!(streamer.count(|c| matches!(c, Call::Start(..))), 1);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test]
    async fn stop_on_idle_session_still_releases() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        assert_eq!(orch.stop(CHAT).await, 0);
        assert_eq!(streamer.count(|c| matches!(c, Call::Release(_))), 1);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test]
    async fn resolution_failure_leaves_session_unchanged() {
        let resolver = ScriptedResolver::instant();
        resolver.fail("nothing here");
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        orch.submit_play(CHAT, "good", "u").await.unwrap();
        let err = orch.submit_play(CHAT, "nothing here", "u").await.unwrap_err();
        assert!(matches!(err, MusicError::Resolution(ResolutionError::NoResults(_))));

        assert_eq!(orch.now_playing(CHAT).await.unwrap().track.title, "good");
        assert!(orch.queue(CHAT).await.is_empty());

        let err = orch.submit_play(CHAT, "   ", "u").await.unwrap_err();
        assert!(matches!(err, MusicError::InvalidCommand(InvalidCommandError::EmptyQuery)));
    }

    #[tokio::test]
    async fn rejected_start_reports_and_stays_idle() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        streamer.reject("broken");
        let (orch, mut events) = setup(&resolver, &streamer);

        let err = orch.submit_play(CHAT, "broken", "u").await.unwrap_err();
        assert!(matches!(err, MusicError::PlaybackStart(ref e) if e.title == "broken"));
        assert!(orch.now_playing(CHAT).await.is_none());
        assert_eq!(streamer.count(|c| matches!(c, Call::Release(_))), 1);
        orch.assert_invariants(CHAT).await;

        let events = drain_events(&mut events);
        assert!(matches!(events.as_slice(), [PlaybackEvent::PlaybackFailed { .. }]));

        orch.submit_play(CHAT, "fine", "u").await.unwrap();
        assert_eq!(orch.now_playing(CHAT).await.unwrap().track.title, "fine");
    }

    #[tokio::test]
    async fn rejected_switch_skips_to_the_following_track() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        streamer.reject("bad");
        let (orch, mut events) = setup(&resolver, &streamer);

        for q in ["first", "bad", "good"] {
            orch.submit_play(CHAT, q, "u").await.unwrap();
        }
        let next = orch.skip(CHAT).await.unwrap().unwrap();
        assert_eq!(next.title, "good");
        assert!(orch.queue(CHAT).await.is_empty());
        orch.assert_invariants(CHAT).await;

        let failed = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, PlaybackEvent::PlaybackFailed { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn stale_track_end_is_ignored() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        orch.submit_play(CHAT, "one", "u").await.unwrap();
        orch.submit_play(CHAT, "two", "u").await.unwrap();
        let one = orch.now_playing(CHAT).await.unwrap().track.id;
        orch.skip(CHAT).await.unwrap();

        assert!(!orch.track_ended(CHAT, &one).await);
        assert_eq!(orch.now_playing(CHAT).await.unwrap().track.title, "two");
    }

    #[tokio::test]
    async fn conversations_are_independent() {
        let resolver = ScriptedResolver::gated();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        let slow = tokio::spawn({
            let orch = orch.clone();
            async move { orch.submit_play(ConversationId(1), "slow", "u").await }
        });
        wait_until(|| resolver.started("slow")).await;

        resolver.open("quick");
        let quick = orch.submit_play(ConversationId(2), "quick", "u").await.unwrap();
        assert!(matches!(quick, Admission::Started(_)));
        assert!(orch.now_playing(ConversationId(1)).await.is_none());

        resolver.release("slow");
        assert!(matches!(slow.await.unwrap().unwrap(), Admission::Started(_)));
        assert_eq!(orch.session_count().await, 2);
    }

    #[tokio::test]
    async fn request_still_resolving_when_queue_runs_dry_starts_later() {
        let resolver = ScriptedResolver::gated();
        resolver.open("A");
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        orch.submit_play(CHAT, "A", "u").await.unwrap();
        let late = tokio::spawn({
            let orch = orch.clone();
            async move { orch.submit_play(CHAT, "B", "u").await }
        });
        wait_until(|| resolver.started("B")).await;

        let a_id = orch.now_playing(CHAT).await.unwrap().track.id;
        assert!(orch.track_ended(CHAT, &a_id).await);
        assert!(orch.now_playing(CHAT).await.is_none());
        assert!(!streamer.connected(CHAT));

        resolver.release("B");
        let b = late.await.unwrap().unwrap();
        assert!(matches!(b, Admission::Started(ref t) if t.title == "B"));
        assert_eq!(orch.now_playing(CHAT).await.unwrap().track.title, "B");
        assert!(streamer.connected(CHAT));
        assert_eq!(streamer.count(|c| matches!(c, Call::Rejoin(_))), 1);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test]
    async fn batch_led_by_unplayable_entry_still_plays_the_rest() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        streamer.reject("broken");
        let (orch, _events) = setup(&resolver, &streamer);

        let outcomes = orch.submit_batch(CHAT, &["broken", "good", "next"], "u").await;

        assert!(matches!(outcomes[0], Err(MusicError::PlaybackStart(ref e)) if e.title == "broken"));
        assert!(matches!(outcomes[1], Ok(Admission::Started(ref t)) if t.title == "good"));
        assert!(matches!(outcomes[2], Ok(Admission::Queued { position: 1, .. })));
        assert_eq!(orch.now_playing(CHAT).await.unwrap().track.title, "good");
        assert!(streamer.connected(CHAT));
        assert_eq!(streamer.count(|c| matches!(c, Call::Release(_))), 1);
        assert_eq!(streamer.count(|c| matches!(c, Call::Rejoin(_))), 1);
        orch.assert_invariants(CHAT).await;
    }

    #[tokio::test]
    async fn skip_into_only_unplayable_tracks_goes_idle() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        streamer.reject("bad1");
        streamer.reject("bad2");
        let (orch, mut events) = setup(&resolver, &streamer);

        for q in ["first", "bad1", "bad2"] {
            orch.submit_play(CHAT, q, "u").await.unwrap();
        }
        assert!(orch.skip(CHAT).await.unwrap().is_none());

        assert!(orch.now_playing(CHAT).await.is_none());
        assert!(orch.queue(CHAT).await.is_empty());
        assert_eq!(streamer.count(|c| matches!(c, Call::Release(_))), 1);
        orch.assert_invariants(CHAT).await;

        let events = drain_events(&mut events);
        let failed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PlaybackEvent::PlaybackFailed { error, .. } => Some(error.title.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(failed, ["bad1", "bad2"]);
        assert!(matches!(events.last(), Some(PlaybackEvent::QueueFinished { .. })));
    }

    #[tokio::test]
    async fn now_playing_event_reports_tracks_still_queued() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, mut events) = setup(&resolver, &streamer);

        for q in ["one", "two", "three"] {
            orch.submit_play(CHAT, q, "u").await.unwrap();
        }
        drain_events(&mut events);
        orch.skip(CHAT).await.unwrap();

        match drain_events(&mut events).as_slice() {
            [PlaybackEvent::NowPlaying { track, queued, .. }] => {
                assert_eq!(track.title, "two");
                assert_eq!(*queued, 1);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn reaper_only_drops_idle_sessions() {
        let resolver = ScriptedResolver::instant();
        let streamer = RecordingStreamer::new();
        let (orch, _events) = setup(&resolver, &streamer);

        orch.submit_play(ConversationId(1), "busy", "u").await.unwrap();
        orch.stop(ConversationId(2)).await;

        assert_eq!(orch.reap_idle(Duration::ZERO).await, [ConversationId(2)]);
        assert_eq!(orch.session_count().await, 1);
        assert_eq!(orch.now_playing(ConversationId(1)).await.unwrap().track.title, "busy");
    }
}
