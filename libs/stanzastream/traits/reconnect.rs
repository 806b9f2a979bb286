use rand::Rng;
use std::time::Duration;

/// Trait for defining reconnection backoff policies
///
/// Implement this trait to control how long the reconnection manager
/// waits before each attempt.
pub trait ReconnectPolicy: Send + Sync {
    /// Get the delay before the given reconnection attempt
    ///
    /// # Arguments
    /// * `attempt` - The attempt number, starting at 1
    ///
    /// # Returns
    /// * `Some(duration)` - Wait this long before reconnecting
    /// * `None` - Stop reconnecting
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Random increasing delay policy
///
/// A random base between 5 and 15 seconds is drawn once per policy
/// instance, then scaled by attempt phase:
/// - attempts 1-7: base (5-15s)
/// - attempts 8-13: 6 x base (30-90s)
/// - attempts 14+: 30 x base (2.5-7.5min), forever
///
/// This is the default policy of the reconnection manager.
#[derive(Debug, Clone)]
pub struct RandomIncreasingDelay {
    base_secs: u64,
}

impl RandomIncreasingDelay {
    pub fn new() -> Self {
        Self {
            base_secs: rand::thread_rng().gen_range(5..=15),
        }
    }

    /// Fix the base instead of drawing it randomly. Used by tests and by
    /// callers that want deterministic pacing.
    pub fn with_base(base_secs: u64) -> Self {
        Self { base_secs }
    }

    pub fn base_secs(&self) -> u64 {
        self.base_secs
    }
}

impl Default for RandomIncreasingDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectPolicy for RandomIncreasingDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let secs = if attempt > 13 {
            self.base_secs * 30
        } else if attempt > 7 {
            self.base_secs * 6
        } else {
            self.base_secs
        };
        Some(Duration::from_secs(secs))
    }
}

/// Fixed delay policy
///
/// Always waits the same amount of time, optionally capped at a maximum
/// number of attempts.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

impl ReconnectPolicy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

/// Never reconnect
#[derive(Debug, Clone)]
pub struct NeverReconnect;

impl ReconnectPolicy for NeverReconnect {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_base_stays_in_range() {
        for _ in 0..50 {
            let policy = RandomIncreasingDelay::new();
            assert!((5..=15).contains(&policy.base_secs()));
        }
    }

    #[test]
    fn phases_scale_the_fixed_base() {
        let policy = RandomIncreasingDelay::with_base(10);
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(7), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(8), Some(Duration::from_secs(60)));
        assert_eq!(policy.next_delay(13), Some(Duration::from_secs(60)));
        assert_eq!(policy.next_delay(14), Some(Duration::from_secs(300)));
        assert_eq!(policy.next_delay(1000), Some(Duration::from_secs(300)));
    }

    #[test]
    fn fixed_delay_respects_max_attempts() {
        let policy = FixedDelay::new(Duration::from_millis(500), Some(3));
        assert!(policy.next_delay(3).is_some());
        assert!(policy.next_delay(4).is_none());
    }
}
