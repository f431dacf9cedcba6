//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Path of the recording upload endpoint, relative to the hub's HTTP base
pub const UPLOAD_PATH: &str = "/api/remote/upload-session";

/// Configuration for the host agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hub base URL (`ws://` or `wss://`)
    pub hub_url: String,

    /// Agent identifier (optional, defaults to hostname)
    pub agent_id: Option<String>,

    /// Tenant API key presented to the hub
    pub api_key: String,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,

    /// Live stream settings
    pub stream: StreamConfig,

    /// Peer-to-peer transport settings
    pub peer: PeerConfig,

    /// Session recording settings
    pub recording: RecordingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://localhost:8080".to_string(),
            agent_id: None,
            api_key: String::new(),
            connect_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            stream: StreamConfig::default(),
            peer: PeerConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Get the agent id, falling back to hostname
    pub fn agent_id(&self) -> String {
        self.agent_id
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// HTTP(S) base URL of the hub, derived from the websocket URL
    pub fn http_base(&self) -> String {
        let base = self.hub_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            base.to_string()
        }
    }

    /// Where finished recordings are uploaded
    pub fn upload_url(&self) -> String {
        self.recording
            .upload_url
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.http_base(), UPLOAD_PATH))
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hub_url.starts_with("ws://") || self.hub_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "hub_url must start with ws:// or wss://, got {}",
                self.hub_url
            )));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingField("api_key".to_string()));
        }
        self.stream.validate()
    }
}

/// Live stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Target capture rate
    pub fps: u32,

    /// Scale factor applied to the captured image (0, 1]
    pub scale: f32,

    /// Frames wider than this are downscaled to fit
    pub max_width: u32,

    /// JPEG quality (1-100)
    pub jpeg_quality: u8,

    /// Live sessions end on their own after this long
    #[serde(with = "duration_secs")]
    pub max_session: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: 10,
            scale: 1.0,
            max_width: 1280,
            jpeg_quality: 70,
            max_session: Duration::from_secs(120),
        }
    }
}

impl StreamConfig {
    /// Time between two captures
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fps == 0 || self.fps > 60 {
            return Err(ConfigError::Invalid(format!(
                "stream.fps must be between 1 and 60, got {}",
                self.fps
            )));
        }
        if !(self.scale > 0.0 && self.scale <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "stream.scale must be in (0, 1], got {}",
                self.scale
            )));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "stream.jpeg_quality must be between 1 and 100, got {}",
                self.jpeg_quality
            )));
        }
        if self.max_width == 0 {
            return Err(ConfigError::Invalid(
                "stream.max_width must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Peer-to-peer transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Attempt a direct path before falling back to relay
    pub enabled: bool,

    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,

    /// How long to wait for the direct path
    #[serde(with = "duration_secs")]
    pub negotiation_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            negotiation_timeout: Duration::from_secs(10),
        }
    }
}

/// Session recording settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory recordings are buffered in until uploaded
    pub directory: PathBuf,

    /// Upload endpoint override (defaults to the hub's upload path)
    pub upload_url: Option<String>,

    /// Timeout for one upload request
    #[serde(with = "duration_secs")]
    pub upload_timeout: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: super::default_data_dir().join("recordings"),
            upload_url: None,
            upload_timeout: Duration::from_secs(120),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
