// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use rand::Rng;

/// Exponential reconnect backoff: `base · 2^n` with ±25% jitter, capped at
/// `max`. Reset on every successful registration.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Forget accumulated failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The capped exponential delay for the current attempt, before jitter.
    pub fn raw_delay(&self) -> Duration {
        let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        let ms = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(ms).min(self.max)
    }

    /// Next delay to sleep, with jitter applied; advances the attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.raw_delay();
        self.attempt = self.attempt.saturating_add(1);
        let jitter: f64 = rand::rng().random_range(0.75..=1.25);
        Duration::from_secs_f64(raw.as_secs_f64() * jitter)
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
