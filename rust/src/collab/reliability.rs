//! Retry pacing shared by the push reconnect loop and the poller.

use std::time::Duration;

/// Jitter spread around the nominal delay: 0.8x to 1.2x.
const JITTER_SPREAD: f64 = 0.4;

/// Growing delay between attempts, capped at `max`, optionally jittered and
/// optionally bounded by an attempt budget.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    budget: Option<u32>,
    nominal: Duration,
    attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl ExponentialBackoff {
    /// `max` below `initial` is raised to `initial`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: 1.5,
            jitter: true,
            budget: None,
            nominal: initial,
            attempts: 0,
        }
    }

    pub fn with_multiplier(self, factor: f64) -> Self {
        Self {
            factor: factor.max(1.0),
            ..self
        }
    }

    pub fn without_jitter(self) -> Self {
        Self {
            jitter: false,
            ..self
        }
    }

    /// After this many delays `next_delay` returns `None`.
    pub fn with_max_attempts(self, budget: u32) -> Self {
        Self {
            budget: Some(budget),
            ..self
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;

        let delay = if self.jitter {
            self.nominal.mul_f64(jitter_factor()).min(self.max)
        } else {
            self.nominal
        };
        self.nominal = self.nominal.mul_f64(self.factor).min(self.max);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.budget, Some(budget) if self.attempts >= budget)
    }

    pub fn reset(&mut self) {
        self.nominal = self.initial;
        self.attempts = 0;
    }
}

fn jitter_factor() -> f64 {
    // fresh random keys per call
    let sample = ahash::RandomState::new().hash_one(0u8);
    let unit = (sample >> 11) as f64 / (1u64 << 53) as f64;
    1.0 - JITTER_SPREAD / 2.0 + JITTER_SPREAD * unit
}
