//! Scripted collaborators for orchestrator tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};

use crate::error::{ResolutionError, StreamError};
use crate::player::events::PlaybackEvent;
use crate::player::gateway::{Resolver, Streamer};
use crate::player::track::{ConversationId, MediaRef, ResolvedTrack, TrackArtifact, TrackId};

/// Resolves every query to a track titled after the query.
///
/// In gated mode each query blocks until the test calls `release` (or
/// `open` beforehand), which lets tests pick the completion order.
pub struct ScriptedResolver {
    gated: bool,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    started: Mutex<HashSet<String>>,
    finished: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    seq: AtomicU64,
}

impl ScriptedResolver {
    fn build(gated: bool) -> Arc<Self> {
        Arc::new(Self {
            gated,
            gates: Mutex::new(HashMap::new()),
            started: Mutex::new(HashSet::new()),
            finished: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
        })
    }

    pub fn instant() -> Arc<Self> {
        Self::build(false)
    }

    pub fn gated() -> Arc<Self> {
        Self::build(true)
    }

    fn gate(&self, query: &str) -> Arc<Semaphore> {
        self.gates
            .lock()
            .unwrap()
            .entry(query.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    /// Lets a gated query through whenever it arrives.
    pub fn open(&self, query: &str) {
        self.gate(query).add_permits(1);
    }

    pub fn release(&self, query: &str) {
        self.open(query);
    }

    pub fn fail(&self, query: &str) {
        self.failing.lock().unwrap().insert(query.to_string());
    }

    pub fn started(&self, query: &str) -> bool {
        self.started.lock().unwrap().contains(query)
    }

    pub fn finished(&self, query: &str) -> bool {
        self.finished.lock().unwrap().contains(query)
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolutionError> {
        self.started.lock().unwrap().insert(query.to_string());
        if self.gated {
            let gate = self.gate(query);
            gate.acquire().await.unwrap().forget();
        }
        self.finished.lock().unwrap().insert(query.to_string());

        if self.failing.lock().unwrap().contains(query) {
            return Err(ResolutionError::NoResults(query.to_string()));
        }
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        Ok(ResolvedTrack {
            id: TrackId(format!("{query}-{n}")),
            title: query.to_string(),
            duration_secs: 180,
            media: MediaRef(PathBuf::from(format!("/tmp/{query}.mp3"))),
            thumbnail: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(ConversationId, String),
    Pause(ConversationId),
    Resume(ConversationId),
    Release(ConversationId),
    Rejoin(ConversationId),
}

/// Records every call; can be told to reject specific titles.
///
/// Models a voice connection like songbird's: `release` leaves voice and the
/// next start has to rejoin before it can play.
#[derive(Default)]
pub struct RecordingStreamer {
    calls: Mutex<Vec<Call>>,
    disconnected: Mutex<HashSet<ConversationId>>,
    rejected: Mutex<HashSet<String>>,
    fail_controls: AtomicBool,
}

impl RecordingStreamer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, title: &str) {
        self.rejected.lock().unwrap().insert(title.to_string());
    }

    pub fn fail_controls(&self, fail: bool) {
        self.fail_controls.store(fail, Ordering::Relaxed);
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn connected(&self, conversation: ConversationId) -> bool {
        !self.disconnected.lock().unwrap().contains(&conversation)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn control_result(&self) -> Result<(), StreamError> {
        if self.fail_controls.load(Ordering::Relaxed) {
            Err(StreamError::new("no active track handle"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Streamer for RecordingStreamer {
    async fn start_or_switch(
        &self,
        conversation: ConversationId,
        track: &TrackArtifact,
    ) -> Result<(), StreamError> {
        self.record(Call::Start(conversation, track.title.clone()));
        if self.disconnected.lock().unwrap().remove(&conversation) {
            self.record(Call::Rejoin(conversation));
        }
        if self.rejected.lock().unwrap().contains(&track.title) {
            return Err(StreamError::new("unplayable input"));
        }
        Ok(())
    }

    async fn pause(&self, conversation: ConversationId) -> Result<(), StreamError> {
        self.record(Call::Pause(conversation));
        self.control_result()
    }

    async fn resume(&self, conversation: ConversationId) -> Result<(), StreamError> {
        self.record(Call::Resume(conversation));
        self.control_result()
    }

    async fn release(&self, conversation: ConversationId) -> Result<(), StreamError> {
        self.record(Call::Release(conversation));
        self.disconnected.lock().unwrap().insert(conversation);
        Ok(())
    }
}

pub fn drain_events(events: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Polls `cond` while letting spawned tasks run; panics after ~2s.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}
