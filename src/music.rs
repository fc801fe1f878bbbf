use serenity::{
    builder::{CreateEmbed, CreateMessage},
    http::Http,
    model::prelude::*,
    prelude::*,
};
use tracing::{debug, warn};

use crate::error::{InvalidCommandError, MusicError};
use crate::panel::{info_embed, now_playing_message};
use crate::player::{Admission, ConversationId, Orchestrator};

type MusicResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const SUBCOMMANDS: &str =
    "Subcommands: join, leave, play <song>, skip, pause, resume, stop, queue, np, control, playlist";

/// Everything a music subcommand needs to know about where it came from.
pub struct Invocation {
    pub channel: ChannelId,
    pub user_voice: Option<ChannelId>,
    pub user_id: UserId,
    pub guild_id: Option<GuildId>,
    pub color: u32,
}

pub async fn handle_music(ctx: &Context, inv: &Invocation, args: &str) -> serenity::Result<()> {
    let mut parts = args.split_whitespace();
    let sub = parts.next().unwrap_or("").to_ascii_lowercase();
    let remainder = parts.collect::<Vec<_>>().join(" ");

    if let Some(guild_id) = inv.guild_id {
        remember_channel(ctx, guild_id, inv.channel).await;
    }

    let result: MusicResult<()> = match sub.as_str() {
        "join" => join(ctx, inv).await,
        "leave" => leave(ctx, inv).await,
        "play" | "p" => play(ctx, inv, &remainder).await,
        "skip" => skip(ctx, inv).await,
        "pause" => pause(ctx, inv).await,
        "resume" => resume(ctx, inv).await,
        "stop" => stop(ctx, inv).await,
        "queue" | "q" => queue(ctx, inv).await,
        "np" | "control" => control(ctx, inv).await,
        "playlist" => playlist(ctx, inv, &remainder).await,
        _ => send_info(&ctx.http, inv.channel, inv.color, "Music", SUBCOMMANDS).await,
    };

    if let Err(err) = result {
        debug!(subcommand = %sub, "music command rejected: {err}");
        let _ = send_info(&ctx.http, inv.channel, inv.color, "Music Error", &format!("{err}")).await;
    }

    Ok(())
}

pub fn conversation(guild_id: GuildId) -> ConversationId {
    ConversationId(guild_id.get())
}

pub async fn orchestrator(ctx: &Context) -> MusicResult<Orchestrator> {
    ctx.data
        .read()
        .await
        .get::<crate::OrchestratorKey>()
        .cloned()
        .ok_or_else(|| "Music player is not initialised".into())
}

async fn remember_channel(ctx: &Context, guild_id: GuildId, channel: ChannelId) {
    let channels = ctx.data.read().await.get::<crate::AnnounceKey>().cloned();
    if let Some(channels) = channels {
        channels.lock().await.insert(guild_id, channel);
    }
}

fn guild_of(inv: &Invocation) -> MusicResult<GuildId> {
    inv.guild_id.ok_or_else(|| InvalidCommandError::NotInGuild.into())
}

/// Joins the requester's voice channel unless the bot is already connected.
async fn ensure_voice(ctx: &Context, inv: &Invocation, guild_id: GuildId) -> MusicResult<()> {
    let manager = songbird::get(ctx)
        .await
        .ok_or("Songbird Voice client placed in at initialisation.")?
        .clone();

    if manager.get(guild_id).is_some() {
        return Ok(());
    }

    let channel_id = voice_channel_for_user_id(ctx, guild_id, inv.user_id)
        .or(inv.user_voice)
        .ok_or(InvalidCommandError::NoVoiceChannel)?;

    manager.join(guild_id, channel_id).await?;
    debug!(guild = %guild_id, channel = %channel_id, "joined voice");
    Ok(())
}

async fn join(ctx: &Context, inv: &Invocation) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    ensure_voice(ctx, inv, guild_id).await?;
    send_info(&ctx.http, inv.channel, inv.color, "Music", "Connected to voice").await
}

async fn leave(ctx: &Context, inv: &Invocation) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    let cleared = orchestrator(ctx).await?.stop(conversation(guild_id)).await;
    let desc = if cleared > 0 {
        format!("Left the voice channel (cleared {cleared} queued)")
    } else {
        "Left the voice channel".to_string()
    };
    send_info(&ctx.http, inv.channel, inv.color, "Music", &desc).await
}

async fn play(ctx: &Context, inv: &Invocation, query: &str) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    if query.trim().is_empty() {
        return Err(InvalidCommandError::EmptyQuery.into());
    }
    ensure_voice(ctx, inv, guild_id).await?;

    let status = inv
        .channel
        .send_message(
            &ctx.http,
            CreateMessage::new().embed(info_embed(inv.color, "Music", &format!("🔍 Searching: {query}"))),
        )
        .await?;

    let requested_by = format!("<@{}>", inv.user_id);
    let outcome = orchestrator(ctx)
        .await?
        .submit_play(conversation(guild_id), query, &requested_by)
        .await;

    if let Err(why) = inv.channel.delete_message(&ctx.http, status.id).await {
        warn!("Failed to delete search status: {why:?}");
    }

    match outcome {
        // The announcer already posts the panel or the failure
        Ok(Admission::Started(_)) | Err(MusicError::PlaybackStart(_)) => Ok(()),
        Ok(Admission::Queued { track, position }) => {
            let desc = format!(
                "**{}** ({})\nPosition in queue: {}",
                track.title,
                track.display_duration(),
                position
            );
            send_info(&ctx.http, inv.channel, inv.color, "Added to queue", &desc).await
        }
        Ok(Admission::Discarded) => {
            send_info(&ctx.http, inv.channel, inv.color, "Music", "Playback was stopped before the track was ready").await
        }
        Err(e) => Err(e.into()),
    }
}

async fn skip(ctx: &Context, inv: &Invocation) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    orchestrator(ctx).await?.skip(conversation(guild_id)).await?;
    send_info(&ctx.http, inv.channel, inv.color, "Music", "⏭ Skipped").await
}

async fn pause(ctx: &Context, inv: &Invocation) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    let track = orchestrator(ctx).await?.pause(conversation(guild_id)).await?;
    send_info(&ctx.http, inv.channel, inv.color, "Music", &format!("⏸ Paused **{}**", track.title)).await
}

async fn resume(ctx: &Context, inv: &Invocation) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    let track = orchestrator(ctx).await?.resume(conversation(guild_id)).await?;
    send_info(&ctx.http, inv.channel, inv.color, "Music", &format!("▶ Resumed **{}**", track.title)).await
}

async fn stop(ctx: &Context, inv: &Invocation) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    let cleared = orchestrator(ctx).await?.stop(conversation(guild_id)).await;
    send_info(
        &ctx.http,
        inv.channel,
        inv.color,
        "Music",
        &format!("⏹ Stopped (cleared {cleared} queued)"),
    )
    .await
}

async fn queue(ctx: &Context, inv: &Invocation) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    let orch = orchestrator(ctx).await?;
    let conv = conversation(guild_id);
    let now = orch.now_playing(conv).await;
    let queued = orch.queue(conv).await;

    let mut desc = match &now {
        Some(now) => format!("Now: **{}** ({})\n", now.track.title, now.track.display_duration()),
        None => "Nothing is playing\n".to_string(),
    };
    if queued.is_empty() {
        desc.push_str("Queue is empty");
    }
    for (i, track) in queued.iter().enumerate().take(20) {
        desc.push_str(&format!("{}. {} ({})\n", i + 1, track.title, track.display_duration()));
    }
    if queued.len() > 20 {
        desc.push_str(&format!("…and {} more", queued.len() - 20));
    }

    send_info(&ctx.http, inv.channel, inv.color, "Queue", &desc).await
}

async fn control(ctx: &Context, inv: &Invocation) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    let now = orchestrator(ctx)
        .await?
        .now_playing(conversation(guild_id))
        .await
        .ok_or(InvalidCommandError::NothingPlaying)?;
    inv.channel
        .send_message(&ctx.http, now_playing_message(&now, guild_id, inv.color))
        .await?;
    Ok(())
}

async fn playlist(ctx: &Context, inv: &Invocation, args: &str) -> MusicResult<()> {
    let guild_id = guild_of(inv)?;
    let conv = conversation(guild_id);
    let store = ctx
        .data
        .read()
        .await
        .get::<crate::PlaylistKey>()
        .cloned()
        .ok_or("Playlist store is not initialised")?;

    let mut parts = args.splitn(2, ' ');
    let action = parts.next().unwrap_or("").to_ascii_lowercase();
    let name = parts.next().unwrap_or("").trim();

    let usage = "Usage: music playlist save|load|delete <name>, music playlist list";
    match action.as_str() {
        "list" => {
            let lists = store.list(conv).await;
            let desc = if lists.is_empty() {
                "No saved playlists".to_string()
            } else {
                lists
                    .iter()
                    .map(|(name, n)| format!("**{name}** ({n} tracks)"))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            send_info(&ctx.http, inv.channel, inv.color, "Playlists", &desc).await
        }
        _ if name.is_empty() => send_info(&ctx.http, inv.channel, inv.color, "Music", usage).await,
        "save" => {
            let orch = orchestrator(ctx).await?;
            let mut queries: Vec<String> = orch
                .now_playing(conv)
                .await
                .map(|now| vec![now.track.query])
                .unwrap_or_default();
            queries.extend(orch.queue(conv).await.into_iter().map(|t| t.query));
            if queries.is_empty() {
                return Err(InvalidCommandError::NothingPlaying.into());
            }
            let count = queries.len();
            store.save(conv, name, queries).await?;
            send_info(
                &ctx.http,
                inv.channel,
                inv.color,
                "Playlists",
                &format!("Saved **{name}** ({count} tracks)"),
            )
            .await
        }
        "load" => {
            let queries = store
                .get(conv, name)
                .await
                .ok_or_else(|| format!("No playlist named {name}"))?;
            ensure_voice(ctx, inv, guild_id).await?;
            send_info(
                &ctx.http,
                inv.channel,
                inv.color,
                "Playlists",
                &format!("Loading **{name}** ({} tracks)…", queries.len()),
            )
            .await?;

            let requested_by = format!("<@{}>", inv.user_id);
            let refs: Vec<&str> = queries.iter().map(String::as_str).collect();
            let outcomes = orchestrator(ctx).await?.submit_batch(conv, &refs, &requested_by).await;

            let (mut started, mut queued, mut failed) = (0, 0, 0);
            for outcome in &outcomes {
                match outcome {
                    Ok(Admission::Started(_)) => started += 1,
                    Ok(Admission::Queued { .. }) => queued += 1,
                    Ok(Admission::Discarded) => {}
                    Err(e) => {
                        debug!(playlist = %name, "playlist entry failed: {e}");
                        failed += 1;
                    }
                }
            }
            let mut desc = format!("**{name}**: {} queued", started + queued);
            if failed > 0 {
                desc.push_str(&format!(", {failed} failed"));
            }
            send_info(&ctx.http, inv.channel, inv.color, "Playlists", &desc).await
        }
        "delete" => {
            let desc = if store.delete(conv, name).await? {
                format!("Deleted **{name}**")
            } else {
                format!("No playlist named {name}")
            };
            send_info(&ctx.http, inv.channel, inv.color, "Playlists", &desc).await
        }
        _ => send_info(&ctx.http, inv.channel, inv.color, "Music", usage).await,
    }
}

async fn send_info(http: &Http, channel: ChannelId, color: u32, title: &str, desc: &str) -> MusicResult<()> {
    let embed: CreateEmbed = info_embed(color, title, desc);
    channel.send_message(http, CreateMessage::new().embed(embed)).await?;
    Ok(())
}

fn voice_channel_for_user_id(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    ctx.cache
        .guild(guild_id)
        .and_then(|guild| guild.voice_states.get(&user_id).and_then(|vs| vs.channel_id))
}
