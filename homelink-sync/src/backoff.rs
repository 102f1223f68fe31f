//! Reconnect delay policies.
//!
//! A policy is asked for one delay per failed attempt and reset whenever a
//! connection is established.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule between reconnect attempts.
pub trait BackoffPolicy: Send + 'static {
    /// Delay before the next attempt.
    fn next_delay(&mut self) -> Duration;

    /// Called once a connection succeeds.
    fn reset(&mut self);
}

/// Same delay every time.
#[derive(Debug, Clone)]
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ConstantBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_DELAY_MS))
    }
}

impl BackoffPolicy for ConstantBackoff {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}

/// `base * multiplier^attempt`, capped at `max`, with optional full jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            multiplier: multiplier.max(1.0),
            jitter: false,
            attempt: 0,
        }
    }

    /// Pick each delay uniformly between 1ms and the computed delay.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn capped(&self) -> Duration {
        let factor = self.multiplier.powi(self.attempt.min(1_024) as i32);
        let raw_ms = (self.base.as_millis() as f64 * factor).round();
        if !raw_ms.is_finite() || raw_ms >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(raw_ms as u64)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.capped();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter {
            jitter(delay)
        } else {
            delay
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn jitter(ceiling: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen();
    let millis = (ceiling.as_millis() as f64 * factor) as u64;
    Duration::from_millis(millis.max(1))
}

const DEFAULT_DELAY_MS: u64 = 3_000;

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

fn default_base_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// `[client.backoff]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    Constant {
        #[serde(default = "default_delay_ms", alias = "base_ms")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(default = "default_base_ms")]
        base_ms: u64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Constant {
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

impl BackoffConfig {
    pub fn build(&self) -> Box<dyn BackoffPolicy> {
        match *self {
            Self::Constant { delay_ms } => {
                Box::new(ConstantBackoff::new(Duration::from_millis(delay_ms)))
            }
            Self::Exponential {
                base_ms,
                max_ms,
                multiplier,
                jitter,
            } => Box::new(
                ExponentialBackoff::new(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(max_ms),
                    multiplier,
                )
                .with_jitter(jitter),
            ),
        }
    }
}
