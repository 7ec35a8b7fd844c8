use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rendezvous::types::{DEFAULT_FRESHNESS_WINDOW, DEFAULT_HEARTBEAT_INTERVAL};
use crate::webrtc::DEFAULT_GATHER_TIMEOUT;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay server nodes connect to
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// Address `peerlink relay` listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Display name; a random one is generated when unset
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Peers not heard from for this long are purged and no longer matched
    /// by connect
    #[serde(default = "default_freshness_window_ms")]
    pub freshness_window_ms: u64,
    /// Upper bound on waiting for candidate gathering
    #[serde(default = "default_gather_timeout_ms")]
    pub gather_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64
}

fn default_freshness_window_ms() -> u64 {
    DEFAULT_FRESHNESS_WINDOW.as_millis() as u64
}

fn default_gather_timeout_ms() -> u64 {
    DEFAULT_GATHER_TIMEOUT.as_millis() as u64
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            bind_address: default_bind_address(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            freshness_window_ms: default_freshness_window_ms(),
            gather_timeout_ms: default_gather_timeout_ms(),
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

impl Config {
    /// Load config from the default path, or create it with defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from `path`, writing defaults there if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        // Missing fields fall back to their serde defaults
        if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the peerlink directory (~/.peerlink)
pub fn get_peerlink_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerlink")
}

/// Get the config file path (~/.peerlink/config.toml)
pub fn get_config_path() -> PathBuf {
    get_peerlink_dir().join("config.toml")
}
