use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::player::session::Session;
use crate::player::track::ConversationId;

pub type SessionHandle = Arc<Mutex<Session>>;

/// Process-wide map from conversation to its session, created lazily.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ConversationId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup and insert happen under one map lock, so concurrent first
    /// lookups for a conversation always share a single session.
    pub async fn get_or_create(&self, conversation: ConversationId) -> SessionHandle {
        let mut map = self.sessions.lock().await;
        map.entry(conversation)
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(conversation))))
            .clone()
    }

    /// Exclusive access to the live session of `conversation`.
    ///
    /// A handle fetched just before the reaper removed it comes back retired;
    /// in that case the lookup is repeated so the caller never mutates an
    /// orphaned session.
    pub async fn lock(&self, conversation: ConversationId) -> OwnedMutexGuard<Session> {
        loop {
            let guard = self.get_or_create(conversation).await.lock_owned().await;
            if !guard.is_retired() {
                return guard;
            }
        }
    }

    /// Drops sessions that have been idle and empty for at least `max_idle`.
    /// Sessions busy in a transition are skipped until the next pass.
    /// Returns the conversations that were dropped.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<ConversationId> {
        let mut map = self.sessions.lock().await;
        let mut reaped = Vec::new();
        map.retain(|conversation, handle| match handle.try_lock() {
            Ok(mut session) if session.is_reapable(max_idle) => {
                session.retire();
                reaped.push(*conversation);
                false
            }
            _ => true,
        });
        reaped
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
