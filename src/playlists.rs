use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::player::ConversationId;

type StoreResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// guild id -> playlist name -> queries in play order
pub type PlaylistMap = HashMap<u64, BTreeMap<String, Vec<String>>>;

#[derive(Serialize, Deserialize, Default)]
struct PlaylistDisk {
    guilds: PlaylistMap,
}

async fn load_disk(path: &Path) -> StoreResult<PlaylistMap> {
    if tokio::fs::metadata(path).await.is_err() {
        save_disk(path, &PlaylistMap::new()).await?;
        return Ok(PlaylistMap::new());
    }

    let s = tokio::fs::read_to_string(path).await?;
    let data: PlaylistDisk = serde_json::from_str(&s)?;
    Ok(data.guilds)
}

async fn save_disk(path: &Path, map: &PlaylistMap) -> StoreResult<()> {
    let data = PlaylistDisk { guilds: map.clone() };
    let s = serde_json::to_string_pretty(&data)?;
    tokio::fs::write(path, s).await?;
    Ok(())
}

/// Named lists of raw queries, persisted as JSON after every change.
pub struct PlaylistStore {
    path: PathBuf,
    playlists: Mutex<PlaylistMap>,
}

impl PlaylistStore {
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let playlists = load_disk(&path).await?;
        Ok(Self {
            path,
            playlists: Mutex::new(playlists),
        })
    }

    pub async fn save(&self, conversation: ConversationId, name: &str, queries: Vec<String>) -> StoreResult<()> {
        let mut map = self.playlists.lock().await;
        map.entry(conversation.0)
            .or_default()
            .insert(name.to_string(), queries);
        save_disk(&self.path, &map).await
    }

    pub async fn get(&self, conversation: ConversationId, name: &str) -> Option<Vec<String>> {
        let map = self.playlists.lock().await;
        map.get(&conversation.0).and_then(|lists| lists.get(name)).cloned()
    }

    /// Playlist names with their track counts, sorted by name.
    pub async fn list(&self, conversation: ConversationId) -> Vec<(String, usize)> {
        let map = self.playlists.lock().await;
        map.get(&conversation.0)
            .map(|lists| lists.iter().map(|(name, q)| (name.clone(), q.len())).collect())
            .unwrap_or_default()
    }

    pub async fn delete(&self, conversation: ConversationId, name: &str) -> StoreResult<bool> {
        let mut map = self.playlists.lock().await;
        let removed = map
            .get_mut(&conversation.0)
            .and_then(|lists| lists.remove(name))
            .is_some();
        if removed {
            save_disk(&self.path, &map).await?;
        }
        Ok(removed)
    }
}
