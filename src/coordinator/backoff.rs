//! Reconnect backoff policy.

use crate::domain::settings::ConnectionSettings;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl From<&ConnectionSettings> for BackoffConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            initial: settings.backoff_initial(),
            multiplier: settings.backoff_multiplier,
            max: settings.backoff_max(),
        }
    }
}

/// Bounded exponential backoff. Delays never decrease until [`reset`](Backoff::reset)
/// and never exceed the configured cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        // A multiplier below 1 or a cap below the start would break monotonicity.
        let multiplier = if config.multiplier.is_finite() && config.multiplier >= 1.0 {
            config.multiplier
        } else {
            1.0
        };
        let initial = config.initial.min(config.max);
        Self {
            initial,
            multiplier,
            max: config.max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = grown.min(self.max);
        delay
    }

    /// Delay the next call to [`next_delay`](Backoff::next_delay) will return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
