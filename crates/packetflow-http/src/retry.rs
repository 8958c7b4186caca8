// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy for page fetches.

use std::time::Duration;

/// Capped exponential backoff.
///
/// Delay before retry `n` (1-indexed) is `initial_delay * multiplier^(n-1)`,
/// never more than `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Policy used by the packet loop: 5 attempts, 500ms base, x1.5, capped at 5s.
    pub fn packet_processing() -> Self {
        Self::new(5, Duration::from_millis(500), 1.5, Duration::from_secs(5))
    }

    /// Calculate the delay before the given retry attempt (1-indexed).
    ///
    /// Attempt 1 is the first retry (after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let base_ms = self.initial_delay.as_millis() as f64;
        let cap_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * factor).min(cap_ms);
        if delay_ms.is_finite() && delay_ms > 0.0 {
            Duration::from_millis(delay_ms as u64)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::packet_processing()
    }
}
