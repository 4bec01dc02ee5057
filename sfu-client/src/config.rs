//! SFU client configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{PeerId, Role, RoomId};

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub signaling: SignalingConfig,
    pub logging: LoggingConfig,
}

/// Per-session parameters supplied at join time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub room_id: String,
    pub user_id: String,
    pub role: Role,
    /// Fixed delay between media capture attempts
    pub capture_retry_delay_ms: u64,
    /// Stop retrying capture after this many attempts (0 = retry forever)
    pub max_capture_attempts: usize,
    /// Capacity of the session event broadcast channel
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_id: String::new(),
            user_id: String::new(),
            role: Role::Member,
            capture_retry_delay_ms: 1000,
            max_capture_attempts: 0,
            event_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>, role: Role) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            role,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        RoomId::new(self.room_id.clone())
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.user_id.clone())
    }

    #[must_use]
    pub const fn capture_retry_delay(&self) -> Duration {
        Duration::from_millis(self.capture_retry_delay_ms)
    }
}

/// Signaling channel parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the relay's signaling endpoint
    pub url: String,
    /// How long a request waits for its response
    pub request_timeout_seconds: u64,
    /// Capacity of the notification broadcast channel
    pub notification_buffer: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3016/signaling".to_string(),
            request_timeout_seconds: 15,
            notification_buffer: 256,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SFU_CLIENT__SESSION__ROOM_ID, SFU_CLIENT__SIGNALING__URL, ...
        builder = builder.add_source(
            Environment::with_prefix("SFU_CLIENT")
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

    /// Check the loaded values, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.session.room_id.trim().is_empty() {
            errors.push("session.room_id must not be empty".to_string());
        }
        if self.session.user_id.trim().is_empty() {
            errors.push("session.user_id must not be empty".to_string());
        }
        if self.session.capture_retry_delay_ms == 0 {
            errors.push("session.capture_retry_delay_ms must be greater than 0".to_string());
        }
        if self.session.event_buffer == 0 {
            errors.push("session.event_buffer must be greater than 0".to_string());
        }
        if !(self.signaling.url.starts_with("ws://") || self.signaling.url.starts_with("wss://")) {
            errors.push(format!(
                "signaling.url must be a ws:// or wss:// URL, got {:?}",
                self.signaling.url
            ));
        }
        if self.signaling.request_timeout_seconds == 0 {
            errors.push("signaling.request_timeout_seconds must be greater than 0".to_string());
        }
        if self.signaling.notification_buffer == 0 {
            errors.push("signaling.notification_buffer must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
