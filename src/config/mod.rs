//! Configuration management for webrtc-master

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// When SDP answers are sent to a viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnswerPolicy {
    /// Answer immediately and again once ICE gathering completes
    #[default]
    Both,
    /// Answer immediately and trickle candidates
    Immediate,
    /// Answer once with the complete local description
    OnGatheringComplete,
}

impl AnswerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerPolicy::Both => "both",
            AnswerPolicy::Immediate => "immediate",
            AnswerPolicy::OnGatheringComplete => "on_gathering_complete",
        }
    }

    /// Send the answer right after it is applied
    pub fn sends_immediate(&self) -> bool {
        !matches!(self, AnswerPolicy::OnGatheringComplete)
    }

    /// Send the final local description when gathering completes
    pub fn sends_on_complete(&self) -> bool {
        !matches!(self, AnswerPolicy::Immediate)
    }

    /// Forward every local candidate as it is generated
    pub fn trickles(&self) -> bool {
        !matches!(self, AnswerPolicy::OnGatheringComplete)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub master: MasterConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Signaling control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Service region, also selects the STUN relay
    #[serde(default = "default_region")]
    pub region: String,

    /// Base URL of the signaling control plane
    #[serde(default = "default_control_plane_url")]
    pub control_plane_url: String,

    /// Bearer token attached to control plane requests
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            control_plane_url: default_control_plane_url(),
            auth_token: None,
        }
    }
}

/// Broadcast session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Interval of the shared stats poll in seconds
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    #[serde(default)]
    pub answer_policy: AnswerPolicy,

    /// Label of the per-viewer data channel
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,

    /// Capture at 1280x720 instead of 640x480
    #[serde(default = "default_use_widescreen")]
    pub use_widescreen: bool,

    /// Join the server side storage session
    #[serde(default)]
    pub enable_media_ingestion: bool,
}

impl MasterConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: default_stats_interval_secs(),
            answer_policy: AnswerPolicy::Both,
            data_channel_label: default_data_channel_label(),
            use_widescreen: true,
            enable_media_ingestion: false,
        }
    }
}

/// Local capture pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// GStreamer video source element
    #[serde(default = "default_video_source")]
    pub video_source: String,

    /// GStreamer audio source element
    #[serde(default = "default_audio_source")]
    pub audio_source: String,

    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Target video bitrate in kbps
    #[serde(default = "default_video_bitrate_kbps")]
    pub video_bitrate_kbps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            video_source: default_video_source(),
            audio_source: default_audio_source(),
            framerate: 30,
            video_bitrate_kbps: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from file, defaults when the file is missing
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.backend.region.trim().is_empty() {
            return Err("Backend region must not be empty".into());
        }

        let url = &self.backend.control_plane_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("Control plane URL must be http(s): {}", url).into());
        }

        if self.master.stats_interval_secs == 0 {
            return Err("Stats interval must be non-zero".into());
        }

        if self.master.data_channel_label.is_empty() {
            return Err("Data channel label must not be empty".into());
        }

        if self.capture.framerate == 0 || self.capture.video_bitrate_kbps == 0 {
            return Err("Capture framerate and bitrate must be non-zero".into());
        }

        Ok(())
    }
}


fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_control_plane_url() -> String {
    "https://kinesisvideo.us-west-2.amazonaws.com".to_string()
}

fn default_stats_interval_secs() -> u64 { 10 }
fn default_data_channel_label() -> String { "kvsDataChannel".to_string() }
fn default_use_widescreen() -> bool { true }
fn default_video_source() -> String { "autovideosrc".to_string() }
fn default_audio_source() -> String { "autoaudiosrc".to_string() }
fn default_framerate() -> u32 { 30 }
fn default_video_bitrate_kbps() -> u32 { 1000 }
fn default_log_level() -> String { "info".to_string() }
