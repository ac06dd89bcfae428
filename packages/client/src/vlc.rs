//! VLC HTTP interface driver.
//!
//! Talks to VLC's built-in web interface (`--intf http`): every control is a
//! GET against `/requests/status.json` with a `command` query parameter, and
//! the same document reports the current state. VLC's volume scale is
//! 0-256 for 0-100%.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::PlayerError;
use crate::player::{PlayerDriver, PlayerStatus};

/// Wire shape of VLC's status.json (the fields we read).
#[derive(Debug, Deserialize)]
struct VlcStatusDocument {
    #[serde(default)]
    state: String,
    /// Position in seconds
    #[serde(default)]
    time: f64,
    /// Total length in seconds
    #[serde(default)]
    length: f64,
    /// 0-256 scale
    #[serde(default)]
    volume: i64,
    #[serde(default = "default_rate")]
    rate: f64,
}

fn default_rate() -> f64 {
    1.0
}

impl VlcStatusDocument {
    fn into_status(self) -> PlayerStatus {
        PlayerStatus {
            position: self.time.max(0.0),
            length: self.length.max(0.0),
            playing: self.state == "playing",
            volume: ((self.volume.max(0) as f64 / 256.0) * 100.0).round() as u32,
            rate: self.rate,
        }
    }
}

pub struct VlcPlayer {
    base_url: String,
    password: String,
    client: reqwest::Client,
}

impl VlcPlayer {
    pub fn new(host: &str, port: u16, password: impl Into<String>) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            password: password.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn request(&self, params: &[(&str, String)]) -> Result<VlcStatusDocument, PlayerError> {
        let response = self
            .client
            .get(format!("{}/requests/status.json", self.base_url))
            .query(params)
            // VLC expects an empty username with the configured password
            .basic_auth("", Some(&self.password))
            .timeout(Duration::from_secs(1))
            .send()
            .await
            .map_err(|e| PlayerError::Request(e.to_string()))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PlayerError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(PlayerError::Request(format!("HTTP {}", response.status())));
        }
        response
            .json::<VlcStatusDocument>()
            .await
            .map_err(|e| PlayerError::Status(e.to_string()))
    }

    async fn command(&self, command: &str, val: Option<String>) -> Result<(), PlayerError> {
        let mut params = vec![("command", command.to_string())];
        if let Some(val) = val {
            params.push(("val", val));
        }
        self.request(&params).await.map(|_| ())
    }

    /// Load a file into a fresh playlist.
    pub async fn open_file(&self, path: &str) -> Result<(), PlayerError> {
        self.command("pl_empty", None).await?;
        self.command("in_play", Some(format!("file://{path}"))).await
    }
}

#[async_trait]
impl PlayerDriver for VlcPlayer {
    async fn status(&self) -> Result<PlayerStatus, PlayerError> {
        Ok(self.request(&[]).await?.into_status())
    }

    async fn play(&self, position: Option<f64>) -> Result<(), PlayerError> {
        self.command("pl_play", None).await?;
        if let Some(position) = position {
            self.seek(position).await?;
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        // pl_forcepause never toggles back to playing, unlike pl_pause
        self.command("pl_forcepause", None).await
    }

    async fn seek(&self, position: f64) -> Result<(), PlayerError> {
        self.command("seek", Some(format!("{}", position.floor() as i64)))
            .await
    }

    async fn set_volume(&self, volume: u32) -> Result<(), PlayerError> {
        let vlc_volume = ((volume.min(100) as f64 / 100.0) * 256.0).floor() as i64;
        self.command("volume", Some(vlc_volume.to_string())).await
    }

    async fn set_rate(&self, rate: f64) -> Result<(), PlayerError> {
        self.command("rate", Some(format!("{rate}"))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_document_maps_to_player_status() {
        // given: a playing VLC at half volume
        let raw = r#"{"state":"playing","time":42.5,"length":120.0,"volume":128,"rate":1.0}"#;

        // when:
        let document: VlcStatusDocument = serde_json::from_str(raw).unwrap();
        let status = document.into_status();

        // then:
        assert!(status.playing);
        assert_eq!(status.position, 42.5);
        assert_eq!(status.length, 120.0);
        assert_eq!(status.volume, 50);
        assert_eq!(status.rate, 1.0);
    }

    #[test]
    fn test_status_document_defaults_for_stopped_player() {
        // given: VLC with nothing loaded reports a sparse document
        let raw = r#"{"state":"stopped"}"#;

        // when:
        let document: VlcStatusDocument = serde_json::from_str(raw).unwrap();
        let status = document.into_status();

        // then:
        assert!(!status.playing);
        assert_eq!(status.position, 0.0);
        assert_eq!(status.rate, 1.0);
    }

    #[test]
    fn test_volume_scale_round_trips_extremes() {
        // given / when / then:
        let muted: VlcStatusDocument =
            serde_json::from_str(r#"{"state":"paused","volume":0}"#).unwrap();
        assert_eq!(muted.into_status().volume, 0);

        let full: VlcStatusDocument =
            serde_json::from_str(r#"{"state":"paused","volume":256}"#).unwrap();
        assert_eq!(full.into_status().volume, 100);
    }
}
