use serenity::{
    async_trait,
    builder::{CreateEmbed, CreateMessage},
    model::{channel::Message, gateway::Ready},
    prelude::*,
};
use songbird::{SerenityInit, Songbird};
use dotenvy::dotenv;
use std::env;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serenity::all::Interaction;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod error;
mod music;
mod panel;
mod player;
mod playlists;
mod resolver;
mod spotify;
mod streamer;

use crate::config::{load_config, AppConfig};
use crate::music::{handle_music, Invocation};
use crate::panel::{forget_channels, handle_component, run_announcer, AnnounceChannels};
use crate::player::{MetadataLookup, Orchestrator, StreamSignal};
use crate::playlists::PlaylistStore;
use crate::resolver::{ensure_media_tools, YtDlpResolver};
use crate::spotify::SpotifyLookup;
use crate::streamer::SongbirdStreamer;

struct Handler {
    prefix: String,
    color: u32,
}

pub struct OrchestratorKey;
impl TypeMapKey for OrchestratorKey { type Value = Orchestrator; }

pub struct PlaylistKey;
impl TypeMapKey for PlaylistKey { type Value = Arc<PlaylistStore>; }

// Where each guild's now-playing and queue-finished notices go
pub struct AnnounceKey;
impl TypeMapKey for AnnounceKey { type Value = AnnounceChannels; }

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        // move any data we need out of the potentially non-Send `Message` before awaiting
        let author_is_bot = msg.author.bot;
        let channel_id = msg.channel_id;
        let author_id = msg.author.id;
        let guild_id = msg.guild_id;
        let content = msg.content.clone();
        drop(msg);

        if author_is_bot {
            return;
        }

        let Some(command) = content.trim_start().strip_prefix(self.prefix.as_str()) else {
            return;
        };
        let mut parts = command.trim().split_whitespace();
        let cmd = parts.next().unwrap_or("").to_ascii_lowercase();
        let args = parts.collect::<Vec<_>>().join(" ");

        match cmd.as_str() {
            "ping" => {
                if let Err(why) = channel_id.say(&ctx.http, "Pong!").await {
                    warn!("Error sending message: {why:?}");
                }
            }
            "help" => {
                if let Err(why) = channel_id.send_message(&ctx.http, help_message(&self.prefix, self.color)).await {
                    warn!("Error sending help: {why:?}");
                }
            }
            "music" => {
                let user_voice = guild_id.and_then(|gid| {
                    ctx.cache
                        .guild(gid)
                        .and_then(|g| g.voice_states.get(&author_id).and_then(|vs| vs.channel_id))
                });
                let inv = Invocation {
                    channel: channel_id,
                    user_voice,
                    user_id: author_id,
                    guild_id,
                    color: self.color,
                };

                if let Err(why) = handle_music(&ctx, &inv, &args).await {
                    warn!("Error handling music command: {why:?}");
                }
            }
            _ => {}
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Connected as {}", ready.user.name);
        info!("Ready: {} guilds", ctx.cache.guild_count());
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Component(mc) = interaction {
            handle_component(&ctx, &mc, self.color).await;
        }
    }
}

fn help_message(prefix: &str, color: u32) -> CreateMessage {
    let fields: Vec<(String, String, bool)> = [
        ("ping", "Pong reply"),
        ("help", "Show this menu"),
        ("music join", "Join your voice channel"),
        ("music play <song>", "Search (Spotify links -> YouTube) and play or queue"),
        ("music skip", "Skip to the next queued track"),
        ("music pause / resume", "Pause or resume the current track"),
        ("music stop", "Stop playback and clear the queue"),
        ("music queue", "Show the queue"),
        ("music np", "Show the now-playing panel"),
        ("music playlist save|load|delete <name>", "Manage saved playlists"),
        ("music playlist list", "List saved playlists"),
        ("music leave", "Stop and disconnect from voice"),
    ]
    .iter()
    .map(|(name, desc)| (format!("{}{}", prefix, name), (*desc).to_string(), false))
    .collect();

    let embed = CreateEmbed::new()
        .title("Help Menu")
        .description("Use the commands below with the prefix")
        .color(color)
        .fields(fields);

    CreateMessage::new().embed(embed)
}

/// Feeds track ends from songbird back into the orchestrator.
async fn forward_signals(orchestrator: Orchestrator, mut signals: mpsc::UnboundedReceiver<StreamSignal>) {
    while let Some(signal) = signals.recv().await {
        let StreamSignal::TrackEnded { conversation, track } = signal;
        let orchestrator = orchestrator.clone();
        // advancing may start the next download's playback; don't hold up other guilds
        tokio::spawn(async move {
            orchestrator.track_ended(conversation, &track).await;
        });
    }
}

async fn reap_sessions(orchestrator: Orchestrator, announce: AnnounceChannels, cfg: AppConfig) {
    let timeout = Duration::from_secs(cfg.session_idle_timeout_secs);
    let mut tick = tokio::time::interval(Duration::from_secs(cfg.reap_interval_secs.max(1)));
    loop {
        tick.tick().await;
        let reaped = orchestrator.reap_idle(timeout).await;
        forget_channels(&announce, &reaped).await;
        let sessions = orchestrator.session_count().await;
        debug!(sessions, "reaper pass done");
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jukebox=info,serenity=warn,songbird=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let token = env::var("DISCORD_TOKEN").expect("DISCORD_TOKEN not set");

    let cfg = match load_config().await {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Failed to load {}: {e}. Using defaults.", config::CONFIG_PATH);
            AppConfig::default()
        }
    };

    ensure_media_tools(&cfg.download_dir)
        .await
        .expect("Failed to prepare media tools (yt-dlp)");

    let playlists = PlaylistStore::open(cfg.playlist_path.clone())
        .await
        .expect("Failed to open playlist store");

    let metadata = SpotifyLookup::from_env().map(|l| Box::new(l) as Box<dyn MetadataLookup>);
    if metadata.is_none() {
        info!("Spotify credentials not set; Spotify links will be searched as plain text");
    }
    let resolver = YtDlpResolver::new(cfg.download_dir.clone(), cfg.ytdlp_format.clone(), metadata);

    let voice = Songbird::serenity();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let streamer = SongbirdStreamer::new(voice.clone(), signal_tx, cfg.default_volume);

    let (orchestrator, events) = Orchestrator::new(Arc::new(resolver), Arc::new(streamer), cfg.resolver_workers);
    let announce: AnnounceChannels = Arc::new(Mutex::new(HashMap::new()));

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_VOICE_STATES;

    let handler = Handler {
        prefix: cfg.prefix.clone(),
        color: cfg.embed_color,
    };

    let mut client = Client::builder(token, intents)
        .register_songbird_with(voice)
        .event_handler(handler)
        .await
        .expect("Err creating client");

    {
        let mut data = client.data.write().await;
        data.insert::<OrchestratorKey>(orchestrator.clone());
        data.insert::<PlaylistKey>(Arc::new(playlists));
        data.insert::<AnnounceKey>(announce.clone());
    }

    tokio::spawn(forward_signals(orchestrator.clone(), signal_rx));
    tokio::spawn(run_announcer(client.http.clone(), announce.clone(), cfg.embed_color, events));
    tokio::spawn(reap_sessions(orchestrator, announce, cfg));

    if let Err(why) = client.start().await {
        error!("Client error: {why:?}");
    }
}
