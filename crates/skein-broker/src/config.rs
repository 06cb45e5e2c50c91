//! Broker configuration

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skein_protocol::CodecConfig;

use crate::error::BrokerError;
use crate::rate_limit::RateLimitConfig;

/// Per-event rate-limit override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLimit {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Frames admitted per window
    pub max_requests: usize,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port for WebSocket upgrades
    #[serde(default = "default_port")]
    pub port: u16,
    /// Admission cap; upgrades past this are rejected with HTTP 503
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle seconds before heartbeat probing starts
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Minimum payload bytes before DEFLATE kicks in
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// DEFLATE level 1..=9
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Enable AES-256-CBC payload encryption
    #[serde(default)]
    pub enable_encryption: bool,
    /// Pre-shared key as 64 hex chars; required when encryption is enabled
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Master switch for the rate limiter
    #[serde(default = "default_true")]
    pub enable_rate_limiting: bool,
    /// Default limiter window in milliseconds
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Default frames admitted per window
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: usize,
    /// Per-event limiter overrides, keyed by event name
    #[serde(default)]
    pub event_rate_limits: HashMap<String, EventLimit>,
    /// Seconds an emitted ack waits before timing out
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4500
}

fn default_max_connections() -> usize {
    10_000
}

fn default_connection_timeout_secs() -> u64 {
    60
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_compression_level() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_window_ms() -> u64 {
    1000
}

fn default_rate_limit_max_requests() -> usize {
    100
}

fn default_ack_timeout_secs() -> u64 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout_secs(),
            compression_threshold: default_compression_threshold(),
            compression_level: default_compression_level(),
            enable_encryption: false,
            encryption_key: None,
            enable_rate_limiting: true,
            rate_limit_window_ms: default_rate_limit_window_ms(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            event_rate_limits: HashMap::new(),
            ack_timeout_secs: default_ack_timeout_secs(),
        }
    }
}

impl BrokerConfig {
    /// Minimum connection timeout (prevents accidental zero = probe storm)
    const MIN_CONNECTION_TIMEOUT_SECS: u64 = 5;

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|e| BrokerError::Config(e.to_string()))
    }

    /// Validate and clamp configuration values
    pub fn validate(&mut self) {
        if self.connection_timeout_secs < Self::MIN_CONNECTION_TIMEOUT_SECS {
            self.connection_timeout_secs = Self::MIN_CONNECTION_TIMEOUT_SECS;
        }
        self.compression_level = self.compression_level.clamp(1, 9);
        if self.rate_limit_window_ms == 0 {
            self.rate_limit_window_ms = default_rate_limit_window_ms();
        }
        if self.ack_timeout_secs == 0 {
            self.ack_timeout_secs = default_ack_timeout_secs();
        }

        if self.enable_encryption && self.parse_encryption_key().is_none() {
            tracing::warn!("enable_encryption set without a valid 64-hex-char key, disabling");
            self.enable_encryption = false;
        }
    }

    fn parse_encryption_key(&self) -> Option<[u8; 32]> {
        let hex_key = self.encryption_key.as_deref()?;
        let bytes = hex::decode(hex_key).ok()?;
        bytes.try_into().ok()
    }

    /// Codec settings derived from this config
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            compression_threshold: self.compression_threshold,
            compression_level: self.compression_level,
            encryption_key: if self.enable_encryption {
                self.parse_encryption_key()
            } else {
                None
            },
        }
    }

    /// Limiter settings derived from this config
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let per_event = self
            .event_rate_limits
            .iter()
            .map(|(event, limit)| {
                (
                    event.clone(),
                    (Duration::from_millis(limit.window_ms), limit.max_requests),
                )
            })
            .collect();
        RateLimitConfig {
            enabled: self.enable_rate_limiting,
            window: Duration::from_millis(self.rate_limit_window_ms),
            max_requests: self.rate_limit_max_requests,
            per_event: Arc::new(per_event),
        }
    }

    /// Idle window before heartbeat probing
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Ack wait duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 4500);
        assert_eq!(config.compression_threshold, 1024);
        assert_eq!(config.compression_level, 6);
        assert!(config.enable_rate_limiting);
        assert_eq!(config.ack_timeout_secs, 30);
    }

    #[test]
    fn test_validate_clamps_level_and_timeouts() {
        let mut config = BrokerConfig {
            compression_level: 99,
            connection_timeout_secs: 0,
            rate_limit_window_ms: 0,
            ..BrokerConfig::default()
        };
        config.validate();
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.connection_timeout_secs, 5);
        assert_eq!(config.rate_limit_window_ms, 1000);
    }

    #[test]
    fn test_bad_encryption_key_disables_encryption() {
        let mut config = BrokerConfig {
            enable_encryption: true,
            encryption_key: Some("not-hex".to_string()),
            ..BrokerConfig::default()
        };
        config.validate();
        assert!(!config.enable_encryption);
        assert!(config.codec_config().encryption_key.is_none());
    }

    #[test]
    fn test_valid_encryption_key_reaches_codec() {
        let mut config = BrokerConfig {
            enable_encryption: true,
            encryption_key: Some("ab".repeat(32)),
            ..BrokerConfig::default()
        };
        config.validate();
        assert!(config.enable_encryption);
        assert_eq!(
            config.codec_config().encryption_key,
            Some([0xAB_u8; 32])
        );
    }

    #[test]
    fn test_toml_parse_with_partial_fields() {
        let parsed: BrokerConfig = toml::from_str(
            r#"
            port = 9100
            rate_limit_max_requests = 3

            [event_rate_limits.say]
            window_ms = 500
            max_requests = 2
            "#,
        )
        .unwrap();
        assert_eq!(parsed.port, 9100);
        assert_eq!(parsed.rate_limit_max_requests, 3);
        assert_eq!(parsed.host, "0.0.0.0");
        let limits = parsed.rate_limit_config();
        assert_eq!(
            limits.per_event.get("say"),
            Some(&(Duration::from_millis(500), 2))
        );
    }
}
