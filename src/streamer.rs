use async_trait::async_trait;
use serenity::model::id::GuildId;
use songbird::id::ChannelId;
use songbird::{Call, Songbird};
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent};
use songbird::tracks::TrackHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::player::{ConversationId, StreamSignal, Streamer, TrackArtifact, TrackId};

/// Plays downloaded files into a guild's voice call through songbird.
///
/// Keeps the live track handle per guild and reports the end of every track
/// it started on `signals`. Remembers the voice channel of each guild so a
/// track arriving after a release can rejoin it.
pub struct SongbirdStreamer {
    manager: Arc<Songbird>,
    handles: Mutex<HashMap<ConversationId, TrackHandle>>,
    channels: Mutex<HashMap<ConversationId, ChannelId>>,
    signals: mpsc::UnboundedSender<StreamSignal>,
    volume: f32,
}

impl SongbirdStreamer {
    pub fn new(manager: Arc<Songbird>, signals: mpsc::UnboundedSender<StreamSignal>, volume: f32) -> Self {
        Self {
            manager,
            handles: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            signals,
            volume,
        }
    }

    async fn handle(&self, conversation: ConversationId) -> Result<TrackHandle, StreamError> {
        self.handles
            .lock()
            .await
            .get(&conversation)
            .cloned()
            .ok_or_else(|| StreamError::new("No active track handle"))
    }

    async fn remember_channel(&self, conversation: ConversationId, call: &Mutex<Call>) {
        if let Some(channel) = call.lock().await.current_channel() {
            self.channels.lock().await.insert(conversation, channel);
        }
    }

    /// The guild's live call, or a fresh join of the last channel it was in.
    async fn call_for(&self, conversation: ConversationId) -> Result<Arc<Mutex<Call>>, StreamError> {
        if let Some(call) = self.manager.get(guild(conversation)) {
            self.remember_channel(conversation, &call).await;
            return Ok(call);
        }

        let channel = self
            .channels
            .lock()
            .await
            .get(&conversation)
            .copied()
            .ok_or_else(|| StreamError::new("Bot is not in a voice channel (use music join)"))?;

        debug!(%conversation, "rejoining voice");
        self.manager
            .join(guild(conversation), channel)
            .await
            .map_err(|e| StreamError::new(format!("Failed to rejoin voice: {e:?}")))
    }
}

fn guild(conversation: ConversationId) -> GuildId {
    GuildId::new(conversation.0)
}

struct TrackEndNotifier {
    conversation: ConversationId,
    track: TrackId,
    signals: mpsc::UnboundedSender<StreamSignal>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let _ = self.signals.send(StreamSignal::TrackEnded {
            conversation: self.conversation,
            track: self.track.clone(),
        });
        Some(Event::Cancel)
    }
}

#[async_trait]
impl Streamer for SongbirdStreamer {
    async fn start_or_switch(
        &self,
        conversation: ConversationId,
        track: &TrackArtifact,
    ) -> Result<(), StreamError> {
        let call = self.call_for(conversation).await?;

        if let Some(previous) = self.handles.lock().await.remove(&conversation) {
            let _ = previous.stop();
        }

        let input = songbird::input::File::new(track.media.path().to_path_buf());
        let handle = call.lock().await.play_input(input.into());

        if let Err(e) = handle.make_playable_async().await {
            let _ = handle.stop();
            return Err(StreamError::new(format!("Failed to make track playable: {e:?}")));
        }

        // End fires for natural ends and for stop(); Error for decode failures mid-track.
        for kind in [TrackEvent::End, TrackEvent::Error] {
            let notifier = TrackEndNotifier {
                conversation,
                track: track.id.clone(),
                signals: self.signals.clone(),
            };
            handle
                .add_event(Event::Track(kind), notifier)
                .map_err(|e| StreamError::new(format!("Failed to watch track end: {e:?}")))?;
        }

        let _ = handle.set_volume(self.volume);
        handle
            .play()
            .map_err(|e| StreamError::new(format!("Failed to play: {e:?}")))?;

        self.handles.lock().await.insert(conversation, handle);
        debug!(%conversation, path = %track.media.path().display(), "streaming");
        Ok(())
    }

    async fn pause(&self, conversation: ConversationId) -> Result<(), StreamError> {
        self.handle(conversation)
            .await?
            .pause()
            .map_err(|e| StreamError::new(format!("Pause failed: {e:?}")))
    }

    async fn resume(&self, conversation: ConversationId) -> Result<(), StreamError> {
        self.handle(conversation)
            .await?
            .play()
            .map_err(|e| StreamError::new(format!("Resume failed: {e:?}")))
    }

    async fn release(&self, conversation: ConversationId) -> Result<(), StreamError> {
        if let Some(handle) = self.handles.lock().await.remove(&conversation) {
            let _ = handle.stop();
        }

        if let Some(call) = self.manager.get(guild(conversation)) {
            self.remember_channel(conversation, &call).await;
            if let Err(e) = self.manager.remove(guild(conversation)).await {
                warn!(%conversation, "Failed to leave voice: {e:?}");
                return Err(StreamError::new(format!("Failed to leave voice: {e:?}")));
            }
        }
        Ok(())
    }
}
