use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::signaling::{default_media_codecs, RtpCodecCapability};

/// Router codecs are numbered from payload type 100 up to the last dynamic
/// payload type, 127
pub const MAX_MEDIA_CODECS: usize = 28;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling server settings
    pub server: ServerConfig,
    /// Media engine settings
    pub engine: EngineConfig,
    /// Correlated channel settings (participant side)
    pub channel: ChannelConfig,
    /// Participant settings
    pub client: ClientConfig,
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Addresses to bind (IPv4 or IPv6 literals)
    pub bind_addresses: Vec<String>,
    /// WebSocket/HTTP port
    pub port: u16,
    /// WebSocket ping interval in seconds
    pub heartbeat_secs: u64,
    /// Delay before exiting once the media engine has died
    pub engine_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addresses: vec!["0.0.0.0".to_string()],
            port: 3000,
            heartbeat_secs: 30,
            engine_grace_secs: 2,
        }
    }
}

/// Listen address for media transports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenIp {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
}

/// Media engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub listen_ips: Vec<ListenIp>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub initial_available_outgoing_bitrate: u32,
    /// Codecs the router accepts
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: Some("127.0.0.1".to_string()),
            }],
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            initial_available_outgoing_bitrate: 1_000_000,
            media_codecs: default_media_codecs(),
        }
    }
}

/// Correlated channel configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Per-request response deadline
    pub request_timeout_ms: u64,
    /// Delay between reconnect attempts
    pub reconnect_interval_ms: u64,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Participant configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Signaling endpoint, including the room path
    pub server_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3000/ws".to_string(),
        }
    }
}
