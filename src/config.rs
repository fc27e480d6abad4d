//! Engine configuration
//!
//! Every knob has a default; a JSON file only needs to name what it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Top-level engine configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session table settings
    pub session: SessionConfig,
    /// Handshake settings
    pub handshake: HandshakeConfig,
    /// Relay retry policy
    pub retry: RetryConfig,
    /// Relay polling settings
    pub relay: RelayConfig,
}

impl EngineConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse from JSON text and validate
    pub fn from_json(text: &str) -> EngineResult<Self> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.session.replay_window == 0 {
            return Err(EngineError::Config("session.replay_window must be > 0".into()));
        }
        if self.session.rekey_after_messages == 0 {
            return Err(EngineError::Config(
                "session.rekey_after_messages must be > 0".into(),
            ));
        }
        if self.session.rekey_after_secs == 0 {
            return Err(EngineError::Config("session.rekey_after_secs must be > 0".into()));
        }
        if self.handshake.timeout_ms == 0 {
            return Err(EngineError::Config("handshake.timeout_ms must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be >= 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(EngineError::Config(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(EngineError::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.relay.poll_interval_ms == 0 {
            return Err(EngineError::Config("relay.poll_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Session table configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How far behind the highest received sequence a message may arrive
    pub replay_window: u64,
    /// Sends after which a session expires and a fresh handshake is required
    pub rekey_after_messages: u64,
    /// Age (seconds) after which a session stops sending and must be
    /// re-established
    pub rekey_after_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            replay_window: 64,
            rekey_after_messages: 100_000,
            rekey_after_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Handshake configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Deadline for a pending handshake (milliseconds)
    pub timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { timeout_ms: 60_000 }
    }
}

impl HandshakeConfig {
    /// Deadline as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry configuration for relay calls
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,
    /// Cap on any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Draw each delay uniformly from `[0, backoff]`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Upper bound of the delay after failed attempt number `attempt`
    /// (0-based), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt.min(63) as i32);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Relay polling configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Pause between inbound polls (milliseconds)
    pub poll_interval_ms: u64,
    /// Per-request timeout for network relays (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl RelayConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
