//! Configuration schema.
//!
//! The core consumes these values; loading them from disk and persisting
//! edits is the embedding application's job. JSON helpers are provided so
//! the demo binaries (and tests) have a concrete format to hand.

use serde::{Deserialize, Serialize};

/// Default UDP port the host listens on.
pub const DEFAULT_PORT: u16 = 48100;
/// Default client-side liveness port (host → client pings and control).
pub const DEFAULT_LIVENESS_PORT: u16 = 48101;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub security: SecurityConfig,
    pub sunshine: SunshineConfig,
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            audio: AudioConfig::default(),
            security: SecurityConfig::default(),
            sunshine: SunshineConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Host listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

/// Audio pipeline settings shared by both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Requested capture/stream rate in Hz; platforms with a fixed native
    /// rate override this.
    pub sample_rate: u32,
    /// 1 or 2.
    pub channels: u16,
    /// Capture fragment hint in milliseconds.
    pub buffer_size_ms: u32,
    /// Opus bitrate in bits per second.
    pub bitrate: u32,
    /// Skip encoding and send raw little-endian i16 PCM.
    pub raw_pcm: bool,
    /// Output endpoint name fragment; empty picks the system default.
    pub virtual_device_name: String,
    /// Render to the default playback device instead of the virtual cable
    /// (debug mode).
    pub use_speaker_mode: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            buffer_size_ms: 20,
            bitrate: 64000,
            raw_pcm: false,
            virtual_device_name: String::new(),
            use_speaker_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require `pair_status == 1` in the handshake.
    pub enable_whitelist: bool,
    /// Let the embedding app mirror the pairing state of the streaming host.
    pub sync_with_sunshine: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_whitelist: true,
            sync_with_sunshine: true,
        }
    }
}

/// Coexisting game-streaming host; only the pairing bit reaches the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SunshineConfig {
    pub host: String,
    pub port: u16,
    pub paired: bool,
}

impl Default for SunshineConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 47989,
            paired: false,
        }
    }
}

/// Client-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host to stream to.
    pub host_ip: String,
    /// Host audio port.
    pub port: u16,
    /// Local port the liveness socket binds on.
    pub liveness_port: u16,
    /// 16-byte client identifier; shorter values are zero-padded.
    pub unique_id: String,
    /// Device name announced in the handshake (≤ 64 bytes).
    pub device_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            liveness_port: DEFAULT_LIVENESS_PORT,
            unique_id: "0123456789ABCDEF".to_string(),
            device_name: "moonmic".to_string(),
        }
    }
}

impl ClientConfig {
    /// Unique id padded/truncated to the 16-byte wire field.
    pub fn unique_id_bytes(&self) -> [u8; 16] {
        let mut id = [0u8; 16];
        let src = self.unique_id.as_bytes();
        let len = src.len().min(16);
        id[..len].copy_from_slice(&src[..len]);
        id
    }
}
