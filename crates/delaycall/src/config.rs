use crate::{Error, Result};
use core::{str::FromStr, time::Duration};

/// Idle window applied when none is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

/// Per-key queue capacity applied when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

pub const DEFAULT_MAX_KEY_LEN: usize = 256;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// What the dispatcher does when a key's worker queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait for the worker to free a slot. The routing lock is released
    /// before waiting, so other keys keep flowing.
    #[default]
    Block,
    /// Fail the request with [`Error::QueueFull`] without waiting.
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(Error::InvalidConfig {
                reason: format!("Unknown overflow policy `{other}` (expected `block` or `reject`)"),
            }),
        }
    }
}

/// Runtime configuration for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayConfig {
    /// How long a worker waits for new traffic before retiring. Also the
    /// throttle applied after each delay-flagged follow-up request.
    pub window: Duration,
    /// Bound of each per-key worker queue.
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Longest key, in bytes, accepted by validation.
    pub max_key_len: usize,
    /// Capacity of the [`DispatchEvent`](crate::DispatchEvent) broadcast
    /// buffer. Slow subscribers lag rather than block the dispatcher.
    pub event_capacity: usize,
    /// Upper bound on how long [`Dispatcher::shutdown`] waits for workers.
    ///
    /// [`Dispatcher::shutdown`]: crate::Dispatcher::shutdown
    pub shutdown_timeout: Duration,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            max_key_len: DEFAULT_MAX_KEY_LEN,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl DelayConfig {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the window, queue capacity, event
    /// capacity or maximum key length is zero.
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "window must be greater than 0".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "queue_capacity must be greater than 0".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "event_capacity must be greater than 0".to_string(),
            });
        }
        if self.max_key_len == 0 {
            return Err(Error::InvalidConfig {
                reason: "max_key_len must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_reference_constants() {
        let config = DelayConfig::default();
        assert_eq!(config.window, Duration::from_millis(100));
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.overflow, OverflowPolicy::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        let zero_window = DelayConfig {
            window: Duration::ZERO,
            ..DelayConfig::default()
        };
        assert!(matches!(
            zero_window.validate(),
            Err(Error::InvalidConfig { .. })
        ));

        let zero_queue = DelayConfig {
            queue_capacity: 0,
            ..DelayConfig::default()
        };
        assert!(zero_queue.validate().is_err());

        let zero_events = DelayConfig {
            event_capacity: 0,
            ..DelayConfig::default()
        };
        assert!(zero_events.validate().is_err());
    }

    #[test]
    fn parses_overflow_policy() {
        assert_eq!("block".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert_eq!("REJECT".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Reject));
        assert!("drop".parse::<OverflowPolicy>().is_err());
    }
}
