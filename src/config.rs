use serde::Deserialize;
use std::{io::ErrorKind, path::PathBuf};

pub const CONFIG_PATH: &str = "config.jsonc";

const DEFAULT_CONFIG: &str = r#"// Jukebox config (JSONC: supports comments)
{
  // Command prefix, including the trailing space
  "prefix": "!is ",
  "embed_color": 5793266,

  // How many downloads may run at once across all guilds
  "resolver_workers": 4,
  "download_dir": "downloads",
  "ytdlp_format": "bestaudio/best",

  // Volume applied to every new track (1.0 = unchanged)
  "default_volume": 0.2,

  // Idle sessions are forgotten after this long; the reaper checks every reap_interval_secs
  "session_idle_timeout_secs": 1800,
  "reap_interval_secs": 300,

  "playlist_path": "playlists.json"
}
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub prefix: String,
    pub embed_color: u32,
    pub resolver_workers: usize,
    pub download_dir: PathBuf,
    pub ytdlp_format: String,
    pub default_volume: f32,
    pub session_idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub playlist_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            prefix: "!is ".to_string(),
            embed_color: 0x5865F2,
            resolver_workers: 4,
            download_dir: PathBuf::from("downloads"),
            ytdlp_format: "bestaudio/best".to_string(),
            default_volume: 0.2,
            session_idle_timeout_secs: 1800,
            reap_interval_secs: 300,
            playlist_path: PathBuf::from("playlists.json"),
        }
    }
}

pub async fn ensure_default_config() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match tokio::fs::metadata(CONFIG_PATH).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tokio::fs::write(CONFIG_PATH, DEFAULT_CONFIG).await?;
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

pub async fn load_config() -> Result<AppConfig, Box<dyn std::error::Error + Send + Sync>> {
    if let Err(e) = ensure_default_config().await {
        tracing::warn!("Could not write default {CONFIG_PATH}: {e}");
    }

    let contents = tokio::fs::read_to_string(CONFIG_PATH).await?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<AppConfig, Box<dyn std::error::Error + Send + Sync>> {
    let cfg: AppConfig = json5::from_str(contents)?;
    Ok(cfg)
}
