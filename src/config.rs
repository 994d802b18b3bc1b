//! Call configuration.
//!
//! Logging defaults follow the build profile: on in debug builds, off in
//! release builds unless `RUST_LOG` is set explicitly.

use crate::error::CallError;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 3_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`,
    /// with up to 20% random jitter added.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_delay_ms);
        let jitter = if capped >= 5 {
            rand::random_range(0..=capped / 5)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub publish_retry: RetryPolicy,
    pub signaling_retry: RetryPolicy,
    pub handshake_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub release_camera_while_sharing: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .enumerate()
                .map(|(i, url)| ServerConfig::stun(format!("default-stun-{i}"), *url))
                .collect(),
            publish_retry: RetryPolicy::default(),
            signaling_retry: RetryPolicy {
                max_attempts: 10,
                base_delay_ms: 500,
                max_delay_ms: 10_000,
            },
            handshake_timeout_ms: 20_000,
            grace_period_ms: 10_000,
            release_camera_while_sharing: false,
        }
    }
}

impl CallConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CallError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| CallError::InvalidConfig(format!("failed to read {:?}: {}", path, e)))?;

        let config: CallConfig = toml::from_str(&contents)
            .map_err(|e| CallError::InvalidConfig(format!("failed to parse {:?}: {}", path, e)))?;

        config.validate()?;
        log::info!("Loaded call config from {:?}", path);
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CallError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| CallError::InvalidConfig(format!("failed to serialize config: {}", e)))?;
        fs::write(path.as_ref(), contents).map_err(|e| {
            CallError::InvalidConfig(format!("failed to write {:?}: {}", path.as_ref(), e))
        })
    }

    /// STUN-only: relay servers are a known limitation, not something to
    /// half-support.
    pub fn validate(&self) -> Result<(), CallError> {
        if self.ice_servers.is_empty() {
            return Err(CallError::InvalidConfig("at least one STUN server is required".into()));
        }
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(CallError::InvalidConfig(format!(
                    "ICE server {} has an empty URL",
                    server.id
                )));
            }
            if server.r#type == "turn" || server.url.starts_with("turn:") || server.url.starts_with("turns:") {
                return Err(CallError::InvalidConfig(format!(
                    "ICE server {} is a TURN relay; only STUN is supported",
                    server.id
                )));
            }
        }
        if self.publish_retry.max_attempts == 0 {
            return Err(CallError::InvalidConfig("publish_retry.max_attempts must be >= 1".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
