//! Exponential backoff with jitter and reset-after-stability.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchwire_core::serde_duration;
use tokio::time::Instant;

/// How a client paces its redials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectStrategy {
    /// Failed dials tolerated before giving up; -1 is unbounded.
    pub max_retries: i32,
    #[serde(with = "serde_duration")]
    pub initial_delay: Duration,
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// A failure this long after the previous attempt starts backoff over.
    #[serde(with = "serde_duration")]
    pub reset_interval: Duration,
    /// Spread each delay by up to 25% either way.
    pub enable_jitter: bool,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self {
            max_retries: -1,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            reset_interval: Duration::from_secs(300),
            enable_jitter: true,
        }
    }
}

impl ReconnectStrategy {
    /// Whether `attempts` failed dials exhaust the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        u32::try_from(self.max_retries).is_ok_and(|max| attempts >= max)
    }
}

/// Backoff bookkeeping owned by a client's run loop.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    pub next_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once attempts were made and the last one is older than the
    /// strategy's reset interval.
    pub fn should_reset(&self, strategy: &ReconnectStrategy, now: Instant) -> bool {
        self.attempts > 0
            && self
                .last_attempt
                .is_some_and(|last| now.saturating_duration_since(last) > strategy.reset_interval)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = Some(Instant::now());
        self.next_delay = Duration::ZERO;
    }

    /// Delay before the next dial: `initial * factor^attempts`, capped, then
    /// jittered if enabled.
    pub fn next_delay(&mut self, strategy: &ReconnectStrategy) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let base = strategy.initial_delay.as_secs_f64() * strategy.backoff_factor.powi(exponent);
        let mut delay = base.min(strategy.max_delay.as_secs_f64());
        if strategy.enable_jitter {
            delay += delay * 0.25 * rand::thread_rng().gen_range(-1.0..=1.0);
        }
        self.next_delay = Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(strategy.max_delay);
        self.next_delay
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.last_attempt = Some(now);
    }
}
