use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub negotiation: NegotiationConfig,
    pub transport: TransportConfig,
    pub topology: TopologyConfig,
    pub activity: ActivityConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty"
    pub format: String,
    pub file_path: Option<String>,
    /// Per-module overrides, e.g. `roomcast_core::session=trace`
    pub targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            targets: Vec::new(),
        }
    }
}

/// Offer/answer and ICE candidate handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Delay between attempts to apply a candidate that arrived early
    pub ice_retry_interval_ms: u64,
    pub ice_retry_attempts: u32,
    /// "auto" (name comparison), "polite" or "impolite"
    pub politeness: String,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_retry_interval_ms: 100,
            ice_retry_attempts: 20,
            politeness: "auto".to_string(),
        }
    }
}

impl NegotiationConfig {
    #[must_use]
    pub const fn ice_retry_interval(&self) -> Duration {
        Duration::from_millis(self.ice_retry_interval_ms)
    }
}

/// Peer connection backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// "webrtc" or "memory"
    pub kind: String,
    /// STUN/TURN urls handed to every peer connection
    pub ice_servers: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: "webrtc".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub initial: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            initial: "mesh".to_string(),
        }
    }
}

/// Speech activity detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Level in dBFS a sample must exceed to count as speech
    pub threshold_db: f64,
    pub sampling_interval_ms: u64,
    /// Weight of the previous level when smoothing, in [0, 1)
    pub smoothing: f64,
    pub required_samples_for_speech: u32,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            threshold_db: -70.0,
            sampling_interval_ms: 100,
            smoothing: 0.1,
            required_samples_for_speech: 5,
        }
    }
}

impl ActivityConfig {
    /// Threshold as a negative dBFS value; positive inputs are negated
    #[must_use]
    pub fn threshold(&self) -> f64 {
        -self.threshold_db.abs()
    }

    #[must_use]
    pub const fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }
}

/// Video compositor output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Default background colour, `rgb(r,g,b)`, `rgba(r,g,b,a)` or `#rrggbb`
    pub background: String,
    /// Fill used for muted or ended sources
    pub placeholder: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            background: "rgb(20,20,20)".to_string(),
            placeholder: "rgb(0,0,0)".to_string(),
        }
    }
}

impl VideoConfig {
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

/// Audio compositor output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_ms: 20,
        }
    }
}

impl AudioConfig {
    /// Samples per mixed frame
    #[must_use]
    pub fn frame_len(&self) -> usize {
        (u64::from(self.sample_rate) * self.frame_ms / 1000) as usize
    }

    #[must_use]
    pub const fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`ROOMCAST__VIDEO__FPS`, ...)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check value ranges, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if self.negotiation.ice_retry_interval_ms == 0 {
            errors.push("negotiation.ice_retry_interval_ms must be positive".to_string());
        }
        if !matches!(
            self.negotiation.politeness.to_lowercase().as_str(),
            "auto" | "polite" | "impolite"
        ) {
            errors.push(format!(
                "negotiation.politeness must be auto, polite or impolite, got {:?}",
                self.negotiation.politeness
            ));
        }
        if !matches!(self.transport.kind.as_str(), "webrtc" | "memory") {
            errors.push(format!(
                "transport.kind must be \"webrtc\" or \"memory\", got {:?}",
                self.transport.kind
            ));
        }
        if let Some(url) = self
            .transport
            .ice_servers
            .iter()
            .find(|url| !["stun:", "stuns:", "turn:", "turns:"].iter().any(|s| url.starts_with(s)))
        {
            errors.push(format!("transport.ice_servers has a non-ICE url {url:?}"));
        }
        if self.topology.initial.parse::<crate::topology::Topology>().is_err() {
            errors.push(format!(
                "topology.initial must be mesh, sfu or mcu, got {:?}",
                self.topology.initial
            ));
        }
        if self.activity.sampling_interval_ms == 0 {
            errors.push("activity.sampling_interval_ms must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.activity.smoothing) {
            errors.push("activity.smoothing must be in [0, 1)".to_string());
        }
        if self.video.width == 0 || self.video.height == 0 {
            errors.push("video.width and video.height must be positive".to_string());
        }
        if self.video.fps == 0 {
            errors.push("video.fps must be positive".to_string());
        }
        if self.audio.sample_rate == 0 || self.audio.frame_len() == 0 {
            errors.push("audio.sample_rate and audio.frame_ms must give a non-empty frame".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.negotiation.ice_retry_interval(), Duration::from_millis(100));
        assert_eq!(config.topology.initial, "mesh");
        assert_eq!(config.activity.required_samples_for_speech, 5);
        assert_eq!(config.audio.frame_len(), 960);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_is_always_negative() {
        let mut activity = ActivityConfig::default();
        assert!((activity.threshold() + 70.0).abs() < f64::EPSILON);

        activity.threshold_db = 55.0;
        assert!((activity.threshold() + 55.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        config.topology.initial = "ring".to_string();
        config.video.fps = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("topology.initial")));
    }

    #[test]
    fn test_transport_validation() {
        let mut config = Config::default();
        assert_eq!(config.transport.kind, "webrtc");

        config.transport.kind = "carrier-pigeon".to_string();
        config.transport.ice_servers.push("http://example.com".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("transport.kind")));
        assert!(errors.iter().any(|e| e.contains("http://example.com")));

        config.transport.kind = "memory".to_string();
        config.transport.ice_servers = vec!["turn:relay.example.com:3478".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_interval() {
        let video = VideoConfig {
            fps: 25,
            ..VideoConfig::default()
        };
        assert_eq!(video.frame_interval(), Duration::from_millis(40));
    }
}
