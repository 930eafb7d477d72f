// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Board operational policies for connect retry and telemetry polling.
//!
//! This module provides configurable policies that control how the engine
//! retries connecting to a board and how often each telemetry tier is read.

use std::time::Duration;

use tokio::time::Instant;

use crate::board::error::BoardError;
use crate::board::status::TpmStatus;
use crate::board::telemetry::TelemetryTier;

/// Policy for retrying failed connection attempts.
pub trait RetryPolicy: Send + Sync {
    /// Determine if the operation should be retried.
    fn should_retry(&self, attempt: u32, error: &BoardError) -> bool;

    /// Get the delay before the next retry attempt.
    fn delay(&self, attempt: u32) -> Duration;

    /// Get the maximum number of attempts allowed.
    fn max_attempts(&self) -> u32;

    /// Pause after all attempts were used up, before starting over.
    fn cooldown(&self) -> Duration;
}

/// Fixed delay retry policy.
///
/// Uses a constant delay between attempts and a longer cool-down once a
/// round of attempts is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDelay {
    max_attempts: u32,
    delay: Duration,
    cooldown: Duration,
}

impl FixedDelay {
    /// Create a new fixed delay policy.
    pub fn new(max_attempts: u32, delay: Duration, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            cooldown,
        }
    }

    /// Five attempts half a second apart, then ten seconds of rest.
    pub fn default_board() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
            cooldown: Duration::from_secs(10),
        }
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::default_board()
    }
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, attempt: u32, error: &BoardError) -> bool {
        // NotSupported is permanent
        attempt < self.max_attempts && !error.is_not_supported()
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

/// Policy for polling the board for status and telemetry.
pub trait PollingPolicy: Send + Sync {
    /// Get the interval between poll cycles.
    fn interval(&self) -> Duration;

    /// Minimum time between two refreshes of `tier`.
    fn tier_interval(&self, tier: TelemetryTier) -> Duration;

    /// Whether `tier` may be read at all with the board in `status`.
    fn should_refresh(&self, tier: TelemetryTier, status: TpmStatus) -> bool;
}

/// Tiered polling policy.
///
/// Cheap quantities are read every cycle, temperatures and PLL lock every
/// few seconds, and registers that are unsafe before initialisation only on
/// initialised boards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieredPolling {
    interval: Duration,
    medium_interval: Duration,
    slow_interval: Duration,
}

impl TieredPolling {
    /// Create a new tiered polling policy.
    pub fn new(interval: Duration, medium_interval: Duration, slow_interval: Duration) -> Self {
        Self {
            interval,
            medium_interval,
            slow_interval,
        }
    }

    /// Create a policy with the standard board intervals.
    pub fn default_board() -> Self {
        Self {
            interval: Duration::from_secs(2),
            medium_interval: Duration::from_secs(5),
            slow_interval: Duration::from_secs(30),
        }
    }
}

impl Default for TieredPolling {
    fn default() -> Self {
        Self::default_board()
    }
}

impl PollingPolicy for TieredPolling {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn tier_interval(&self, tier: TelemetryTier) -> Duration {
        match tier {
            TelemetryTier::Fast => Duration::ZERO,
            TelemetryTier::Medium => self.medium_interval,
            TelemetryTier::Slow => self.slow_interval,
        }
    }

    fn should_refresh(&self, tier: TelemetryTier, status: TpmStatus) -> bool {
        match tier {
            TelemetryTier::Fast | TelemetryTier::Medium => status.is_connected(),
            TelemetryTier::Slow => status.is_initialised(),
        }
    }
}

/// Remembers when each tier was last refreshed.
#[derive(Debug, Clone, Default)]
pub struct TierClock {
    last: [Option<Instant>; 3],
}

impl TierClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tiers due for a refresh at `now`; marks them refreshed.
    pub fn due(
        &mut self,
        policy: &dyn PollingPolicy,
        status: TpmStatus,
        now: Instant,
    ) -> Vec<TelemetryTier> {
        let mut due = Vec::new();
        for (slot, tier) in TelemetryTier::ALL.into_iter().enumerate() {
            if !policy.should_refresh(tier, status) {
                continue;
            }
            let elapsed = self.last[slot].map(|at| now.saturating_duration_since(at));
            if elapsed.map_or(true, |elapsed| elapsed >= policy.tier_interval(tier)) {
                self.last[slot] = Some(now);
                due.push(tier);
            }
        }
        due
    }

    /// Forget all refresh times, so every allowed tier is read next cycle.
    pub fn reset(&mut self) {
        self.last = [None; 3];
    }
}
