//! Engine configuration
//!
//! All tunables for the orchestration engine live in [`EngineConfig`], which
//! can be built in code or read from a JSON file. Missing fields fall back to
//! the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, ChannelResult};

/// Default number of attempts for substrate-mutating calls.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay between attempts (multiplied by the attempt number).
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Upper bound accepted for `max_attempts`.
const MAX_ATTEMPTS_CEILING: u32 = 10;

/// Default retention for persistent topic storage.
pub const DEFAULT_RETENTION_DAYS: u32 = 365;

/// Default number of history records loaded when joining a channel.
pub const DEFAULT_HISTORY_COUNT: usize = 30;

/// Default capacity for the engine event broadcast channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Attempt budget and linear backoff for retried substrate calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * base_delay_ms` before the next try.
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    /// Create a policy, clamping the attempt count into `1..=10`.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_CEILING),
            base_delay_ms: base_delay.as_millis() as u64,
        }
    }

    /// Base delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

/// Configuration for the channel orchestration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry behaviour for every substrate-mutating call.
    pub retry: RetryPolicy,
    /// Storage node that persists persistent-topic records. `None` skips storage.
    pub storage_node: Option<String>,
    /// Retention applied to persistent topics when storage is enabled.
    pub retention_days: u32,
    /// History records replayed on join when the caller does not say otherwise.
    pub default_history_count: usize,
    /// Capacity of the engine event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            storage_node: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            default_history_count: DEFAULT_HISTORY_COUNT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> ChannelResult<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| ChannelError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> ChannelResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ChannelError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> ChannelResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(ChannelError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts > MAX_ATTEMPTS_CEILING {
            return Err(ChannelError::Config(format!(
                "retry.max_attempts must be at most {}",
                MAX_ATTEMPTS_CEILING
            )));
        }
        if matches!(self.storage_node.as_deref(), Some(node) if node.trim().is_empty()) {
            return Err(ChannelError::Config(
                "storage_node must not be empty".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ChannelError::Config(
                "event_channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder-style override of the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder-style override of the storage node.
    pub fn with_storage_node(mut self, node: impl Into<String>) -> Self {
        self.storage_node = Some(node.into());
        self
    }
}
