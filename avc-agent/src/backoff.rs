// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * backoff.rs - Bounded exponential back-off.
 */

use std::time::Duration;

/// Default first delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default upper bound of the delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential back-off doubling from an initial delay up to a maximum.
///
/// With the `rand` feature, up to 10% of random jitter is added to each delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max: max.max(initial),
            attempts: 0,
            jitter: cfg!(feature = "rand"),
        }
    }

    /// Disables jitter, making the delays deterministic.
    pub fn without_jitter(mut self) -> Backoff {
        self.jitter = false;
        self
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the delay before the next attempt and advances the back-off.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts.min(31)).unwrap_or(u32::MAX);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        if self.jitter {
            delay + jitter(delay)
        } else {
            delay
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(feature = "rand")]
fn jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let max_ms = (delay.as_millis() / 10) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(not(feature = "rand"))]
fn jitter(_delay: Duration) -> Duration {
    Duration::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap() {
        let mut backoff = Backoff::default().without_jitter();
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_is_bounded() {
        let mut backoff = Backoff::default();
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(66));
        }
    }
}
