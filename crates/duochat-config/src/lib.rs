//! Shared configuration for duochat clients
//!
//! Reads from ~/.duochat/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default Nostr relays used as the rendezvous broker
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://temp.iris.to",
    "wss://relay.damus.io",
    "wss://nos.lol",
];

/// Default lobby topic
pub const DEFAULT_LOBBY_TOPIC: &str = "duochat-global-lobby-v5";

/// Reflection-only servers used when no relay credentials can be obtained
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
    "stun:stun.cloudflare.com:3478",
];

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lobby: LobbyConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

/// Rendezvous lobby configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_staleness_window_ms")]
    pub staleness_window_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            topic: default_topic(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            staleness_window_ms: default_staleness_window_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

fn default_topic() -> String {
    DEFAULT_LOBBY_TOPIC.to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1500
}

fn default_staleness_window_ms() -> u64 {
    3000
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_ms() -> u64 {
    2000
}

/// What to do when the remote media never shows up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeTimeoutPolicy {
    /// Go back to searching (default)
    Resume,
    /// Stop and wait for the user
    Idle,
}

impl Default for HandshakeTimeoutPolicy {
    fn default() -> Self {
        Self::Resume
    }
}

/// Session lifecycle timing and policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_identity_timeout_ms")]
    pub identity_timeout_ms: u64,
    #[serde(default = "default_stream_handshake_timeout_ms")]
    pub stream_handshake_timeout_ms: u64,
    #[serde(default = "default_connection_attempt_timeout_ms")]
    pub connection_attempt_timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub handshake_timeout_policy: HandshakeTimeoutPolicy,
    #[serde(default = "default_true")]
    pub auto_resume_on_drop: bool,
    #[serde(default = "default_true")]
    pub accept_calls_while_idle: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity_timeout_ms: default_identity_timeout_ms(),
            stream_handshake_timeout_ms: default_stream_handshake_timeout_ms(),
            connection_attempt_timeout_ms: default_connection_attempt_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            handshake_timeout_policy: HandshakeTimeoutPolicy::default(),
            auto_resume_on_drop: true,
            accept_calls_while_idle: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_identity_timeout_ms() -> u64 {
    20000
}

fn default_stream_handshake_timeout_ms() -> u64 {
    20000
}

fn default_connection_attempt_timeout_ms() -> u64 {
    12000
}

fn default_settle_delay_ms() -> u64 {
    150
}

/// One NAT traversal endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// NAT traversal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// Endpoint minting short-lived relay credentials
    #[serde(default)]
    pub credentials_url: Option<String>,
    #[serde(default = "default_credentials_timeout_ms")]
    pub credentials_timeout_ms: u64,
    #[serde(default = "default_fallback_servers")]
    pub fallback_servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            credentials_url: None,
            credentials_timeout_ms: default_credentials_timeout_ms(),
            fallback_servers: default_fallback_servers(),
        }
    }
}

fn default_credentials_timeout_ms() -> u64 {
    5000
}

fn default_fallback_servers() -> Vec<IceServer> {
    DEFAULT_STUN_SERVERS.iter().map(|s| IceServer::stun(*s)).collect()
}

/// Data channel chat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: usize,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_max_rtt_ms")]
    pub max_rtt_ms: u64,
    #[serde(default = "default_error_display_ms")]
    pub error_display_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            ping_interval_ms: default_ping_interval_ms(),
            max_rtt_ms: default_max_rtt_ms(),
            error_display_ms: default_error_display_ms(),
        }
    }
}

fn default_max_message_chars() -> usize {
    1000
}

fn default_rate_limit_per_sec() -> usize {
    5
}

fn default_ping_interval_ms() -> u64 {
    2000
}

fn default_max_rtt_ms() -> u64 {
    60000
}

fn default_error_display_ms() -> u64 {
    5000
}

/// Capture constraints requested from the local devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_ideal_width")]
    pub ideal_width: u32,
    #[serde(default = "default_ideal_height")]
    pub ideal_height: u32,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    #[serde(default = "default_ideal_frame_rate")]
    pub ideal_frame_rate: u32,
    #[serde(default = "default_max_frame_rate")]
    pub max_frame_rate: u32,
    #[serde(default = "default_facing_mode")]
    pub facing_mode: String,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ideal_width: default_ideal_width(),
            ideal_height: default_ideal_height(),
            max_width: default_max_width(),
            max_height: default_max_height(),
            ideal_frame_rate: default_ideal_frame_rate(),
            max_frame_rate: default_max_frame_rate(),
            facing_mode: default_facing_mode(),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

fn default_ideal_width() -> u32 {
    1280
}

fn default_ideal_height() -> u32 {
    720
}

fn default_max_width() -> u32 {
    1920
}

fn default_max_height() -> u32 {
    1080
}

fn default_ideal_frame_rate() -> u32 {
    30
}

fn default_max_frame_rate() -> u32 {
    60
}

fn default_facing_mode() -> String {
    "user".to_string()
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from an explicit path, writing defaults there if it is missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content =
                fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;

        Ok(())
    }
}

/// Get the duochat directory (~/.duochat)
pub fn get_duochat_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DUOCHAT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".duochat")
}

/// Get the config file path (~/.duochat/config.toml)
pub fn get_config_path() -> PathBuf {
    get_duochat_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.lobby.relays.is_empty());
        assert_eq!(config.lobby.staleness_window_ms, 3000);
        assert_eq!(config.lobby.reconnect_attempts, 3);
        assert_eq!(config.chat.max_message_chars, 1000);
        assert_eq!(config.ice.fallback_servers.len(), DEFAULT_STUN_SERVERS.len());
        assert!(config.ice.credentials_url.is_none());
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.lobby.topic, DEFAULT_LOBBY_TOPIC);
        assert_eq!(config.session.settle_delay_ms, 150);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[lobby]
topic = "custom-lobby"
heartbeat_interval_ms = 1200
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.lobby.topic, "custom-lobby");
        assert_eq!(config.lobby.heartbeat_interval_ms, 1200);
        assert_eq!(config.lobby.reconnect_backoff_ms, 2000);
    }

    #[test]
    fn test_handshake_policy_default() {
        let config = Config::default();
        assert_eq!(
            config.session.handshake_timeout_policy,
            HandshakeTimeoutPolicy::Resume
        );
    }

    #[test]
    fn test_handshake_policy_idle() {
        let toml = r#"
[session]
handshake_timeout_policy = "idle"
auto_resume_on_drop = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.session.handshake_timeout_policy,
            HandshakeTimeoutPolicy::Idle
        );
        assert!(!config.session.auto_resume_on_drop);
        assert!(config.session.accept_calls_while_idle);
    }

    #[test]
    fn test_parse_ice_servers() {
        let toml = r#"
[ice]
credentials_url = "https://example.com/api/turn-credentials"

[[ice.fallback_servers]]
urls = ["turn:turn.example.com:3478"]
username = "user"
credential = "secret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.ice.credentials_url.as_deref(),
            Some("https://example.com/api/turn-credentials")
        );
        assert_eq!(config.ice.fallback_servers.len(), 1);
        assert_eq!(
            config.ice.fallback_servers[0].username.as_deref(),
            Some("user")
        );
    }

    #[test]
    fn test_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.chat.rate_limit_per_sec, 5);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.lobby.topic, config.lobby.topic);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "lobby = [[[").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
