use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Location of the document store snapshot.
pub fn data_path() -> PathBuf {
    config_path("data.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub token_ttl_hours: u64,
    pub admin_usernames: Vec<String>,
    pub energy: EnergyConfig,
    pub matchmaking: MatchmakingConfig,
    pub game: GameConfig,
    pub progression: ProgressionConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
            token_ttl_hours: 168,
            admin_usernames: Vec::new(),
            energy: EnergyConfig::default(),
            matchmaking: MatchmakingConfig::default(),
            game: GameConfig::default(),
            progression: ProgressionConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnergyConfig {
    pub max_lives: u32,
    pub regen_seconds: u64,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            max_lives: 5,
            regen_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchmakingConfig {
    pub base_tolerance: u32,
    pub tolerance_per_second: u32,
    pub max_tolerance: u32,
    pub default_wait_seconds: u64,
    pub history_size: usize,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            base_tolerance: 100,
            tolerance_per_second: 10,
            max_tolerance: 800,
            default_wait_seconds: 30,
            history_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameConfig {
    pub turn_seconds: u64,
    pub reconnect_grace_seconds: u64,
    pub rematch_window_seconds: u64,
    pub chat_history: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            turn_seconds: 30,
            reconnect_grace_seconds: 30,
            rematch_window_seconds: 60,
            chat_history: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressionConfig {
    pub xp_win: u64,
    pub xp_draw: u64,
    pub xp_loss: u64,
    pub elo_k: f64,
    pub starting_skill: i32,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            xp_win: 50,
            xp_draw: 20,
            xp_loss: 10,
            elo_k: 32.0,
            starting_skill: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub auth_requests: u32,
    pub api_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            auth_requests: 10,
            api_requests: 120,
        }
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Initialize config directory with defaults if missing.
pub fn init() -> anyhow::Result<()> {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base)
            .with_context(|| format!("Failed to create config directory {}", base.display()))?;
    }

    let server_path = config_path("server.json");
    if !server_path.exists() {
        let default_config = ServerConfig {
            jwt_secret: random_secret(),
            ..ServerConfig::default()
        };
        fs::write(&server_path, serde_json::to_string_pretty(&default_config)?)
            .context("Failed to write default server.json")?;
        tracing::info!("Wrote default config to {}", server_path.display());
    }

    Ok(())
}

/// Load the server configuration.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
    let path = config_path("server.json");
    let data = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: ServerConfig = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if config.jwt_secret == ServerConfig::default().jwt_secret {
        tracing::warn!("server.json uses the placeholder jwtSecret");
    }
    Ok(config)
}
