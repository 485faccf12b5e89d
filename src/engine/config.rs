//! Engine configuration

use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Maximum identifier lengths in bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdLimits {
    pub room_id: usize,
    pub user_id: usize,
    pub user_name: usize,
    pub stream_id: usize,
    pub extra_info: usize,
    pub mixer_task_id: usize,
}

impl Default for IdLimits {
    fn default() -> Self {
        Self {
            room_id: 128,
            user_id: 64,
            user_name: 256,
            stream_id: 256,
            extra_info: 1024,
            mixer_task_id: 256,
        }
    }
}

impl IdLimits {
    pub fn check_room_id(&self, room_id: &str) -> Result<()> {
        check_id("room id", room_id, self.room_id)
    }

    pub fn check_user_id(&self, user_id: &str) -> Result<()> {
        check_id("user id", user_id, self.user_id)
    }

    /// User names may contain any printable text, only the length is bounded
    pub fn check_user_name(&self, user_name: &str) -> Result<()> {
        if user_name.len() > self.user_name {
            return Err(Error::InvalidId {
                field: "user name",
                reason: format!("{} bytes, limit is {}", user_name.len(), self.user_name),
            });
        }
        Ok(())
    }

    pub fn check_stream_id(&self, stream_id: &str) -> Result<()> {
        check_id("stream id", stream_id, self.stream_id)
    }

    pub fn check_extra_info(&self, extra_info: &str) -> Result<()> {
        if extra_info.len() > self.extra_info {
            return Err(Error::ExtraInfoTooLong {
                len: extra_info.len(),
                limit: self.extra_info,
            });
        }
        Ok(())
    }

    pub fn check_mixer_task_id(&self, task_id: &str) -> Result<()> {
        check_id("mixer task id", task_id, self.mixer_task_id)
    }
}

/// Identifiers are non-empty ASCII made of letters, digits and `-_.~!#$&+=@`
fn check_id(field: &'static str, id: &str, limit: usize) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId {
            field,
            reason: "empty".into(),
        });
    }
    if id.len() > limit {
        return Err(Error::InvalidId {
            field,
            reason: format!("{} bytes, limit is {}", id.len(), limit),
        });
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "-_.~!#$&+=@".contains(*c)))
    {
        return Err(Error::InvalidId {
            field,
            reason: format!("illegal character {:?}", c),
        });
    }
    Ok(())
}

/// Engine configuration options
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backoff for room logins, publish and play requests
    pub retry: RetryPolicy,

    /// Period of publish and play quality reports
    pub quality_interval: Duration,

    /// Maximum concurrently live media players
    pub media_player_capacity: usize,

    /// Media player clock resolution
    pub media_player_tick: Duration,

    /// Default media player progress report interval
    pub media_player_progress_interval: Duration,

    /// SEI payloads waiting for the next video frame, per channel
    pub sei_queue_limit: usize,

    /// Largest accepted SEI payload in bytes
    pub sei_max_len: usize,

    /// Identifier length limits
    pub limits: IdLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            quality_interval: Duration::from_secs(3),
            media_player_capacity: 4,
            media_player_tick: Duration::from_millis(40),
            media_player_progress_interval: Duration::from_secs(1),
            sei_queue_limit: 32,
            sei_max_len: 4096,
            limits: IdLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Set the retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the quality report interval
    pub fn quality_interval(mut self, interval: Duration) -> Self {
        self.quality_interval = interval.max(Duration::from_millis(100));
        self
    }

    /// Set the media player pool capacity
    pub fn media_player_capacity(mut self, capacity: usize) -> Self {
        self.media_player_capacity = capacity;
        self
    }

    /// Set the media player clock resolution
    pub fn media_player_tick(mut self, tick: Duration) -> Self {
        self.media_player_tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Set the SEI queue limit
    pub fn sei_queue_limit(mut self, limit: usize) -> Self {
        self.sei_queue_limit = limit;
        self
    }

    /// Set identifier limits
    pub fn limits(mut self, limits: IdLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.quality_interval, Duration::from_secs(3));
        assert_eq!(config.media_player_capacity, 4);
        assert_eq!(config.limits.stream_id, 256);
        assert_eq!(config.limits.extra_info, 1024);
    }

    #[test]
    fn test_builder_pattern() {
        let config = EngineConfig::default()
            .quality_interval(Duration::from_millis(10))
            .media_player_capacity(2)
            .media_player_tick(Duration::ZERO)
            .sei_queue_limit(4)
            .retry(RetryPolicy::default().unbounded());

        assert_eq!(config.quality_interval, Duration::from_millis(100));
        assert_eq!(config.media_player_capacity, 2);
        assert_eq!(config.media_player_tick, Duration::from_millis(1));
        assert_eq!(config.sei_queue_limit, 4);
        assert_eq!(config.retry.max_attempts, None);
    }

    #[test]
    fn test_id_validation() {
        let limits = IdLimits::default();
        assert!(limits.check_room_id("room-1").is_ok());
        assert!(limits.check_stream_id("stream_a.b").is_ok());

        assert!(matches!(
            limits.check_room_id(""),
            Err(Error::InvalidId { field: "room id", .. })
        ));
        assert!(limits.check_stream_id(&"s".repeat(257)).is_err());
        assert!(limits.check_stream_id(&"s".repeat(256)).is_ok());
        assert!(limits.check_user_id("has space").is_err());
        assert!(limits.check_user_name("Any Name ✓").is_ok());
    }

    #[test]
    fn test_extra_info_limit() {
        let limits = IdLimits::default();
        assert!(limits.check_extra_info(&"x".repeat(1024)).is_ok());
        assert!(matches!(
            limits.check_extra_info(&"x".repeat(1025)),
            Err(Error::ExtraInfoTooLong { len: 1025, limit: 1024 })
        ));
    }
}
