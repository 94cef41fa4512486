// HTTP client for the external game server: room setup, match status, and
// game-log retrieval.

use std::path::Path;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Endpoints;
use crate::error::{ArenaError, TransientError};

#[derive(Debug, Serialize)]
struct SetupSettings {
    #[serde(rename = "playerNames")]
    player_names: [String; 2],
}

#[derive(Debug, Serialize)]
struct SetupRequest {
    #[serde(rename = "gameName")]
    game_name: String,
    session: String,
    password: String,
    #[serde(rename = "gameSettings")]
    game_settings: SetupSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientStatus {
    pub name: String,
    pub won: bool,
    pub lost: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchStatus {
    pub status: String,
    #[serde(rename = "gamelogFilename")]
    pub gamelog_filename: Option<String>,
    #[serde(default)]
    pub clients: Vec<ClientStatus>,
}

impl MatchStatus {
    pub fn is_over_with_log(&self) -> bool {
        self.status == "over" && self.gamelog_filename.is_some()
    }
}

pub struct GameServerClient {
    base_url: String,
    http: Client,
}

impl GameServerClient {
    pub fn new(endpoints: &Endpoints) -> Self {
        GameServerClient {
            base_url: endpoints.gameserver_base_url(),
            http: Client::new(),
        }
    }

    pub async fn create_room(
        &self,
        game_name: &str,
        session: &str,
        password: &str,
        player_names: [String; 2],
    ) -> Result<(), ArenaError> {
        let body = SetupRequest {
            game_name: game_name.to_string(),
            session: session.to_string(),
            password: password.to_string(),
            game_settings: SetupSettings { player_names },
        };

        let response = self
            .http
            .post(format!("{}/setup", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(TransientError::from)?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ArenaError::MatchFailed {
                reason: format!("room setup rejected: {detail}"),
            });
        }
        debug!(session, "room created");
        Ok(())
    }

    pub async fn get_match_status(&self, game_name: &str, session: &str) -> Result<MatchStatus, ArenaError> {
        let response = self
            .http
            .get(format!("{}/status/{}/{}", self.base_url, game_name, session))
            .send()
            .await
            .map_err(TransientError::from)?;

        if !response.status().is_success() {
            warn!(session, status = %response.status(), "match status poll failed");
            return Err(ArenaError::Transient(crate::error::TransientError::Http(
                response.error_for_status().unwrap_err(),
            )));
        }

        response.json().await.map_err(|e| ArenaError::Transient(TransientError::from(e)))
    }

    pub async fn download_gamelog(&self, gamelog_filename: &str, local_path: &Path) -> Result<(), ArenaError> {
        let response = self
            .http
            .get(format!("{}/gamelog/{}", self.base_url, gamelog_filename))
            .send()
            .await
            .map_err(TransientError::from)?;

        if !response.status().is_success() {
            return Err(ArenaError::MatchFailed {
                reason: format!("gamelog download failed with status {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(TransientError::from)?;
        tokio::fs::write(local_path, &bytes)
            .await
            .map_err(|e| ArenaError::Transient(TransientError::from(e)))?;
        Ok(())
    }
}
