use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ResolutionError;
use crate::player::{MediaRef, MetadataLookup, ResolvedTrack, Resolver, TrackId};

type ToolResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const BIN_DIR: &str = ".bin";

/// Downloads yt-dlp into `.bin` if missing, checks for ffmpeg and makes sure
/// the download directory exists.
pub async fn ensure_media_tools(download_dir: &Path) -> ToolResult<()> {
    const YTDLP_BIN: &str = "yt-dlp";
    const YTDLP_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp";

    let ytdlp_path = PathBuf::from(BIN_DIR).join(YTDLP_BIN);

    if fs::metadata(&ytdlp_path).await.is_err() {
        info!("Downloading yt-dlp to {}", ytdlp_path.display());
        fs::create_dir_all(BIN_DIR).await?;
        let bytes = Client::new()
            .get(YTDLP_URL)
            .send()
            .await?
            .error_for_status()?;
        let content = bytes.bytes().await?;
        fs::write(&ytdlp_path, &content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&ytdlp_path).await?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&ytdlp_path, perms).await?;
        }
    }

    // yt-dlp needs ffmpeg to extract mp3
    match Command::new("ffmpeg").arg("-version").output().await {
        Ok(o) if o.status.success() => debug!("ffmpeg found"),
        Ok(o) => warn!("ffmpeg exists but failed to run: {}", String::from_utf8_lossy(&o.stderr)),
        Err(_) => warn!("ffmpeg not found on PATH. Downloads will fail to convert."),
    }

    fs::create_dir_all(download_dir).await?;
    prepend_path(BIN_DIR)?;
    Ok(())
}

fn prepend_path(bin: &str) -> ToolResult<()> {
    let bin_path = PathBuf::from(bin);
    let mut paths: Vec<PathBuf> = env::var_os("PATH")
        .map(|p| env::split_paths(&p).collect())
        .unwrap_or_default();

    if !paths.iter().any(|p| p == &bin_path) {
        paths.insert(0, bin_path);
        let new_path = env::join_paths(paths)?;
        unsafe {
            env::set_var("PATH", &new_path);
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
}

/// Resolves queries by letting yt-dlp search, download and convert to mp3.
pub struct YtDlpResolver {
    download_dir: PathBuf,
    format: String,
    metadata: Option<Box<dyn MetadataLookup>>,
    seq: AtomicU64,
}

impl YtDlpResolver {
    pub fn new(
        download_dir: PathBuf,
        format: String,
        metadata: Option<Box<dyn MetadataLookup>>,
    ) -> Self {
        Self {
            download_dir,
            format,
            metadata,
            seq: AtomicU64::new(0),
        }
    }

    /// What to hand yt-dlp: YouTube links as-is, everything else as a search.
    async fn target_for(&self, query: &str) -> Result<String, ResolutionError> {
        if is_youtube_link(query) {
            return Ok(query.to_string());
        }
        let terms = match &self.metadata {
            Some(lookup) if lookup.matches(query) => lookup.search_terms(query).await?,
            _ => query.to_string(),
        };
        Ok(format!("ytsearch1:{terms}"))
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolutionError> {
        let target = self.target_for(query).await?;
        let template = self.download_dir.join("%(id)s.%(ext)s");
        debug!(%target, "running yt-dlp");

        let out = Command::new("yt-dlp")
            .arg("-f")
            .arg(&self.format)
            .arg("-x")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--no-playlist")
            .arg("--no-simulate")
            .arg("-j")
            .arg("-o")
            .arg(template.to_string_lossy().to_string())
            .arg(&target)
            .output()
            .await?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ResolutionError::Download(last_line(&stderr).to_string()));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        let info = parse_info(&stdout)?.ok_or_else(|| ResolutionError::NoResults(query.to_string()))?;

        let media = self.download_dir.join(format!("{}.mp3", info.id));
        if fs::metadata(&media).await.is_err() {
            return Err(ResolutionError::Download(format!(
                "yt-dlp reported success but {} is missing",
                media.display()
            )));
        }

        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        info!(title = %info.title, path = %media.display(), "downloaded");
        Ok(ResolvedTrack {
            id: TrackId(format!("{}#{}", info.id, n)),
            title: info.title,
            duration_secs: info.duration.map(|d| d.max(0.0) as u64).unwrap_or(0),
            media: MediaRef(media),
            thumbnail: info.thumbnail,
        })
    }
}

pub fn is_youtube_link(query: &str) -> bool {
    query.starts_with("http") && (query.contains("youtube.com") || query.contains("youtu.be"))
}

/// First JSON object line of yt-dlp's `-j` output; `None` when the search was empty.
fn parse_info(stdout: &str) -> Result<Option<YtDlpInfo>, ResolutionError> {
    let Some(line) = stdout.lines().find(|l| l.trim_start().starts_with('{')) else {
        return Ok(None);
    };
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| ResolutionError::Download(format!("unreadable yt-dlp output: {e}")))
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("yt-dlp failed")
}
