//! Engine configuration.
//!
//! Every tunable lives here as a named field so no component re-derives a
//! window or limit on its own. Durations travel as milliseconds in JSON.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LiveError, LiveResult};

/// How long a presence record stays fresh after its last heartbeat.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(90);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How far ahead of the local clock a `last_seen` may be and still count as fresh.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(30);
pub const DEFAULT_FEED_LIMIT: usize = 50;
/// Priorities at or below this value count as high priority (1 is most urgent).
pub const DEFAULT_HIGH_PRIORITY_THRESHOLD: u8 = 2;
pub const DEFAULT_RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(with = "duration_ms")]
    pub freshness_window: Duration,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub max_clock_skew: Duration,
    pub feed_limit: usize,
    pub high_priority_threshold: u8,
    #[serde(with = "duration_ms")]
    pub resubscribe_initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub resubscribe_max_backoff: Duration,
    /// `None` retries forever.
    pub resubscribe_max_attempts: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            feed_limit: DEFAULT_FEED_LIMIT,
            high_priority_threshold: DEFAULT_HIGH_PRIORITY_THRESHOLD,
            resubscribe_initial_backoff: DEFAULT_RESUBSCRIBE_INITIAL_BACKOFF,
            resubscribe_max_backoff: DEFAULT_RESUBSCRIBE_MAX_BACKOFF,
            resubscribe_max_attempts: None,
        }
    }
}

impl EngineConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            freshness_window: Duration::from_millis(150),
            max_clock_skew: Duration::from_millis(50),
            resubscribe_initial_backoff: Duration::from_millis(10),
            resubscribe_max_backoff: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> LiveResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| LiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LiveResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(LiveError::Config("heartbeat_interval must be non-zero".into()));
        }
        if self.freshness_window < self.heartbeat_interval {
            return Err(LiveError::Config(format!(
                "freshness_window ({:?}) is shorter than heartbeat_interval ({:?})",
                self.freshness_window, self.heartbeat_interval
            )));
        }
        if self.feed_limit == 0 {
            return Err(LiveError::Config("feed_limit must be at least 1".into()));
        }
        if self.high_priority_threshold == 0 {
            return Err(LiveError::Config("high_priority_threshold must be at least 1".into()));
        }
        if self.resubscribe_initial_backoff > self.resubscribe_max_backoff {
            return Err(LiveError::Config(
                "resubscribe_initial_backoff exceeds resubscribe_max_backoff".into(),
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.resubscribe_initial_backoff,
            max: self.resubscribe_max_backoff,
            max_attempts: self.resubscribe_max_attempts,
        }
    }
}

/// Exponential backoff for change-channel resubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        EngineConfig::default().backoff()
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.freshness_window, config.heartbeat_interval * 3);
        assert!(config.resubscribe_max_attempts.is_none());
    }

    #[test]
    fn test_for_testing_is_valid() {
        assert!(EngineConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(r#"{"freshness_window": 900000, "feed_limit": 20}"#).unwrap();
        assert_eq!(config.freshness_window, Duration::from_secs(15 * 60));
        assert_eq!(config.feed_limit, 20);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_json_roundtrip_in_millis() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["heartbeat_interval"], serde_json::json!(30_000));
        assert_eq!(json["resubscribe_initial_backoff"], serde_json::json!(500));
    }

    #[test]
    fn test_window_shorter_than_heartbeat_rejected() {
        let err = EngineConfig::from_json(r#"{"freshness_window": 1000}"#).unwrap_err();
        assert!(matches!(err, LiveError::Config(_)));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = EngineConfig { feed_limit: 0, ..EngineConfig::default() };
        assert!(config.validate().is_err());
        let config = EngineConfig { high_priority_threshold: 0, ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(EngineConfig::from_json("{"), Err(LiveError::Config(_))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }
}
