//! Now-playing embeds, the button panel under them, and the task that posts
//! orchestrator events back into each guild's channel.

use serenity::all::{ButtonStyle, ComponentInteraction};
use serenity::builder::{
    CreateActionRow, CreateButton, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, EditMessage,
};
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId};
use serenity::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::player::{ConversationId, NowPlaying, PlaybackEvent, PlaybackState, TrackArtifact};

/// Channel each guild last issued a music command from; events are posted there.
pub type AnnounceChannels = Arc<Mutex<HashMap<GuildId, ChannelId>>>;

pub fn info_embed(color: u32, title: &str, desc: &str) -> CreateEmbed {
    CreateEmbed::new().title(title).description(desc).color(color)
}

pub fn now_playing_embed(track: &TrackArtifact, state: PlaybackState, queued: usize, color: u32) -> CreateEmbed {
    let heading = match state {
        PlaybackState::Paused => "⏸ Paused",
        _ => "🎵 Now Playing",
    };
    let mut embed = CreateEmbed::new()
        .title(heading)
        .description(format!("**{}**", track.title))
        .field("Duration", track.display_duration(), true)
        .field("Requested by", track.requested_by.clone(), true)
        .field("Up next", queued.to_string(), true)
        .color(color);
    if let Some(th) = &track.thumbnail {
        embed = embed.thumbnail(th.clone());
    }
    embed
}

/// custom_id format: music:<action>:<guild_id>
pub fn control_rows(guild_id: GuildId) -> Vec<CreateActionRow> {
    let id = |action: &str| format!("music:{}:{}", action, guild_id);
    vec![CreateActionRow::Buttons(vec![
        CreateButton::new(id("skip")).style(ButtonStyle::Primary).label("⏭ Skip"),
        CreateButton::new(id("pause")).style(ButtonStyle::Secondary).label("⏸ Pause"),
        CreateButton::new(id("resume")).style(ButtonStyle::Success).label("▶ Resume"),
        CreateButton::new(id("stop")).style(ButtonStyle::Danger).label("⏹ Stop"),
        CreateButton::new(id("info")).style(ButtonStyle::Secondary).label("ℹ Info"),
    ])]
}

pub fn now_playing_message(now: &NowPlaying, guild_id: GuildId, color: u32) -> CreateMessage {
    CreateMessage::new()
        .embed(now_playing_embed(&now.track, now.state, now.queued, color))
        .components(control_rows(guild_id))
}

/// Drops the announce channel of guilds whose sessions were reaped.
pub async fn forget_channels(channels: &AnnounceChannels, reaped: &[ConversationId]) {
    let mut map = channels.lock().await;
    for conversation in reaped {
        map.remove(&GuildId::new(conversation.0));
    }
}

/// Parses a panel button id into (action, guild).
pub fn parse_custom_id(custom_id: &str) -> Option<(&str, GuildId)> {
    let mut parts = custom_id.split(':');
    if parts.next()? != "music" {
        return None;
    }
    let action = parts.next()?;
    let guild = parts.next()?.parse::<u64>().ok().filter(|g| *g != 0)?;
    Some((action, GuildId::new(guild)))
}

/// Posts playback events until the orchestrator is dropped.
pub async fn run_announcer(
    http: Arc<Http>,
    channels: AnnounceChannels,
    color: u32,
    mut events: mpsc::UnboundedReceiver<PlaybackEvent>,
) {
    while let Some(event) = events.recv().await {
        let conversation = match &event {
            PlaybackEvent::NowPlaying { conversation, .. }
            | PlaybackEvent::PlaybackFailed { conversation, .. }
            | PlaybackEvent::QueueFinished { conversation } => *conversation,
        };
        let guild_id = GuildId::new(conversation.0);
        let Some(channel) = channels.lock().await.get(&guild_id).copied() else {
            debug!(%conversation, "no announce channel for event");
            continue;
        };

        let message = match event {
            PlaybackEvent::NowPlaying { track, queued, .. } => CreateMessage::new()
                .embed(now_playing_embed(&track, PlaybackState::Playing, queued, color))
                .components(control_rows(guild_id)),
            PlaybackEvent::PlaybackFailed { error, .. } => {
                CreateMessage::new().embed(info_embed(color, "Playback Error", &error.to_string()))
            }
            PlaybackEvent::QueueFinished { .. } => {
                CreateMessage::new().embed(info_embed(color, "Music", "Queue finished"))
            }
        };

        if let Err(why) = channel.send_message(&http, message).await {
            warn!(%conversation, "Error posting playback event: {why:?}");
        }
    }
}

pub async fn handle_component(ctx: &Context, mc: &ComponentInteraction, color: u32) {
    let Some((action, guild_id)) = parse_custom_id(&mc.data.custom_id) else {
        return;
    };
    let Some(orchestrator) = crate::music::orchestrator(ctx).await.ok() else {
        return;
    };
    let conversation = ConversationId(guild_id.get());
    let who = format!("<@{}>", mc.user.id);

    let (reply, ephemeral) = match action {
        "skip" => match orchestrator.skip(conversation).await {
            Ok(_) => (format!("⏭ Skipped by {who}"), false),
            Err(e) => (e.to_string(), true),
        },
        "pause" => match orchestrator.pause(conversation).await {
            Ok(track) => (format!("⏸ {who} paused **{}**", track.title), false),
            Err(e) => (e.to_string(), true),
        },
        "resume" => match orchestrator.resume(conversation).await {
            Ok(track) => (format!("▶ {who} resumed **{}**", track.title), false),
            Err(e) => (e.to_string(), true),
        },
        "stop" => {
            let cleared = orchestrator.stop(conversation).await;
            (format!("⏹ Stopped by {who} (cleared {cleared} queued)"), false)
        }
        "info" => match orchestrator.now_playing(conversation).await {
            Some(now) => (
                format!("{}\n⏱ {}", now.track.title, now.track.display_duration()),
                true,
            ),
            None => ("Nothing is playing".to_string(), true),
        },
        _ => ("Unknown action".to_string(), true),
    };

    let response = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new()
            .content(reply)
            .ephemeral(ephemeral),
    );
    if let Err(why) = mc.create_response(&ctx.http, response).await {
        warn!("Failed to answer button press: {why:?}");
    }

    // Reflect pause/resume on the panel the button lives on
    if matches!(action, "pause" | "resume") {
        if let Some(now) = orchestrator.now_playing(conversation).await {
            let edit = EditMessage::new().embed(now_playing_embed(&now.track, now.state, now.queued, color));
            if let Err(why) = mc.message.clone().edit(&ctx.http, edit).await {
                warn!("Failed to refresh control panel: {why:?}");
            }
        }
    }
}
