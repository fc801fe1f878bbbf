//! Play-request admission.
//!
//! A request is ticketed under the session lock, resolved on the bounded
//! resolver pool without holding any lock, then admitted under the lock again.
//! Completed resolutions are admitted strictly in ticket order, so the queue
//! follows submission order even when downloads finish out of order, and only
//! the first admitted track can take an Idle session to Playing.

use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{InvalidCommandError, ResolutionError, Result};
use crate::player::Orchestrator;
use crate::player::session::{PendingAdmission, PlaybackState, Session};
use crate::player::track::{ConversationId, ResolvedTrack, TrackArtifact};

/// What happened to a play request.
#[derive(Debug, Clone)]
pub enum Admission {
    /// The session was idle; the track is now playing.
    Started(TrackArtifact),
    /// Appended behind the current track at this 1-based position.
    Queued { track: TrackArtifact, position: usize },
    /// A stop arrived while the request was still resolving.
    Discarded,
}

impl Orchestrator {
    /// Resolves `query` and either starts it or queues it.
    pub async fn submit_play(
        &self,
        conversation: ConversationId,
        query: &str,
        requested_by: &str,
    ) -> Result<Admission> {
        if query.trim().is_empty() {
            return Err(InvalidCommandError::EmptyQuery.into());
        }
        let mut outcomes = self.submit_batch(conversation, &[query], requested_by).await;
        outcomes.pop().unwrap_or(Ok(Admission::Discarded))
    }

    /// Submits several queries at once. They are ticketed under a single
    /// session lock, so they keep their relative order in the queue even
    /// though they resolve concurrently. Blank queries are skipped.
    pub async fn submit_batch(
        &self,
        conversation: ConversationId,
        queries: &[&str],
        requested_by: &str,
    ) -> Vec<Result<Admission>> {
        let mut tickets = Vec::with_capacity(queries.len());
        {
            let mut session = self.inner.registry.lock(conversation).await;
            for query in queries.iter().map(|q| q.trim()).filter(|q| !q.is_empty()) {
                let ticket = self.inner.tickets.fetch_add(1, Ordering::Relaxed);
                let (reply, outcome) = oneshot::channel();
                session.open_ticket(ticket, query, requested_by, reply);
                debug!(%conversation, ticket, %query, "play request ticketed");
                tickets.push((ticket, query.to_string(), outcome));
            }
        }

        let mut outcomes = Vec::with_capacity(tickets.len());
        for (ticket, query, outcome) in tickets {
            let this = self.clone();
            tokio::spawn(async move {
                let resolved = this.resolve_pooled(&query).await;
                this.complete_admission(conversation, ticket, resolved).await;
            });
            outcomes.push(outcome);
        }

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            // The sender only goes away without replying if the session was torn down.
            results.push(outcome.await.unwrap_or(Ok(Admission::Discarded)));
        }
        results
    }

    async fn resolve_pooled(&self, query: &str) -> std::result::Result<ResolvedTrack, ResolutionError> {
        let _permit = self
            .inner
            .pool
            .acquire()
            .await
            .map_err(|_| ResolutionError::PoolClosed)?;
        self.inner.resolver.resolve(query).await
    }

    async fn complete_admission(
        &self,
        conversation: ConversationId,
        ticket: u64,
        resolved: std::result::Result<ResolvedTrack, ResolutionError>,
    ) {
        let mut session = self.inner.registry.lock(conversation).await;
        if !session.fill_ticket(ticket, resolved) {
            info!(%conversation, ticket, "dropping resolution that finished after stop");
            return;
        }

        while let Some((ready, outcome)) = session.take_ready() {
            let PendingAdmission {
                ticket,
                query,
                requested_by,
                reply,
                ..
            } = ready;
            let result = match outcome {
                Ok(resolved) => {
                    let track = TrackArtifact::from_resolved(resolved, &query, &requested_by);
                    self.admit(&mut session, track).await
                }
                Err(e) => {
                    warn!(%conversation, ticket, %query, error = %e, "resolution failed");
                    Err(e.into())
                }
            };
            // The submitter may have gone away; the admission still stands.
            let _ = reply.send(result);
        }
    }

    async fn admit(&self, session: &mut Session, track: TrackArtifact) -> Result<Admission> {
        if session.state() == PlaybackState::Idle {
            self.inner.advancer.start(session, track.clone()).await?;
            Ok(Admission::Started(track))
        } else {
            let position = session.enqueue(track.clone());
            info!(conversation = %session.conversation(), title = %track.title, position, "queued");
            Ok(Admission::Queued { track, position })
        }
    }
}
