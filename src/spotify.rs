use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use reqwest::Client;
use serde::Deserialize;
use std::env;

use crate::error::ResolutionError;
use crate::player::MetadataLookup;

#[derive(Deserialize)]
struct SpotifyToken {
    access_token: String,
}

#[derive(Deserialize)]
struct SpotifyTrack {
    name: String,
    artists: Vec<SpotifyArtist>,
}

#[derive(Deserialize)]
struct SpotifyArtist {
    name: String,
}

/// Rewrites Spotify track links into "title artist" search terms using the
/// Web API's client-credentials flow.
pub struct SpotifyLookup {
    client: Client,
    client_id: String,
    client_secret: String,
}

impl SpotifyLookup {
    /// `None` unless both SPOTIFY_CLIENT_ID and SPOTIFY_CLIENT_SECRET are set.
    pub fn from_env() -> Option<Self> {
        let client_id = env::var("SPOTIFY_CLIENT_ID").ok().filter(|v| !v.is_empty())?;
        let client_secret = env::var("SPOTIFY_CLIENT_SECRET").ok().filter(|v| !v.is_empty())?;
        Some(Self {
            client: Client::new(),
            client_id,
            client_secret,
        })
    }

    async fn fetch_token(&self) -> Result<SpotifyToken, reqwest::Error> {
        let auth = format!("{}:{}", self.client_id, self.client_secret);
        let auth_b64 = B64_ENGINE.encode(auth);

        self.client
            .post("https://accounts.spotify.com/api/token")
            .header("Authorization", format!("Basic {}", auth_b64))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn fetch_track(&self, token: &str, id: &str) -> Result<SpotifyTrack, reqwest::Error> {
        let url = format!("https://api.spotify.com/v1/tracks/{}", id);
        self.client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl MetadataLookup for SpotifyLookup {
    fn matches(&self, query: &str) -> bool {
        parse_spotify_track_id(query).is_some()
    }

    async fn search_terms(&self, link: &str) -> Result<String, ResolutionError> {
        let id = parse_spotify_track_id(link)
            .ok_or_else(|| ResolutionError::Metadata(format!("not a Spotify track link: {link}")))?;
        let token = self
            .fetch_token()
            .await
            .map_err(|e| ResolutionError::Metadata(format!("token request failed: {e}")))?;
        let track = self
            .fetch_track(&token.access_token, &id)
            .await
            .map_err(|e| ResolutionError::Metadata(format!("track lookup failed: {e}")))?;

        let artist = track
            .artists
            .first()
            .map(|a| a.name.as_str())
            .unwrap_or("Unknown");
        tracing::debug!(%id, title = %track.name, %artist, "resolved Spotify link");
        Ok(format!("{} {}", track.name, artist))
    }
}

/// Track id from `spotify:track:ID` or `https://open.spotify.com/track/ID?...`.
pub fn parse_spotify_track_id(s: &str) -> Option<String> {
    if let Some(pos) = s.find("spotify:track:") {
        return s[pos + "spotify:track:".len()..]
            .split(&['?', '&'][..])
            .next()
            .filter(|id| !id.is_empty())
            .map(|x| x.to_string());
    }

    if let Some(idx) = s.find("open.spotify.com/") {
        let rest = &s[idx..];
        let track = rest.find("/track/")?;
        return rest[track + "/track/".len()..]
            .split(&['?', '&', '/'][..])
            .next()
            .filter(|id| !id.is_empty())
            .map(|x| x.to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_track_links_and_uris() {
        assert_eq!(
            parse_spotify_track_id("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC?si=abc").as_deref(),
            Some("4uLU6hMCjMI75M1A2tKUQC")
        );
        assert_eq!(
            parse_spotify_track_id("https://open.spotify.com/intl-de/track/4uLU6hMCjMI75M1A2tKUQC").as_deref(),
            Some("4uLU6hMCjMI75M1A2tKUQC")
        );
        assert_eq!(
            parse_spotify_track_id("spotify:track:4uLU6hMCjMI75M1A2tKUQC").as_deref(),
            Some("4uLU6hMCjMI75M1A2tKUQC")
        );
    }

    #[test]
    fn ignores_non_track_queries() {
        assert_eq!(parse_spotify_track_id("never gonna give you up"), None);
        assert_eq!(parse_spotify_track_id("https://open.spotify.com/album/xyz"), None);
        assert_eq!(parse_spotify_track_id("https://example.com/track/123"), None);
    }
}
