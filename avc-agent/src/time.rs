// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * time.rs - Clocks, symbolic timers and deferred wall-clock adjustment.
 */

//! Clock and timer service.
//!
//! Monotonic time is represented as a [Duration] since an arbitrary origin, which keeps the
//! timer arithmetic independent of [Instant] and allows tests to drive time with [ManualClock].

use std::{
    cell::Cell,
    collections::BTreeMap,
    rc::Rc,
    time::{Duration, Instant, SystemTime},
};

use tracing::{debug, info};

use crate::config::ClockSource;

/// Source of monotonic and wall-clock time.
pub trait Clock {
    /// Monotonic time since an arbitrary, fixed origin.
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time.
    fn wall(&self) -> SystemTime;

    /// Sets the wall-clock time of the device.
    fn set_wall(&self, time: SystemTime);
}

/// Clock backed by the operating system.
///
/// Setting the wall clock is recorded as an offset applied to subsequent [Clock::wall] calls,
/// the system time itself is owned by the platform.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    wall_offset: Cell<Option<(SystemTime, Duration)>>,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock {
            origin: Instant::now(),
            wall_offset: Cell::new(None),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> SystemTime {
        match self.wall_offset.get() {
            Some((set_to, set_at)) => set_to + self.monotonic().saturating_sub(set_at),
            None => SystemTime::now(),
        }
    }

    fn set_wall(&self, time: SystemTime) {
        self.wall_offset.set(Some((time, self.monotonic())));
    }
}

/// Clock whose time only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give another to the agent.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
    wall: Rc<Cell<SystemTime>>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            now: Rc::new(Cell::new(Duration::ZERO)),
            wall: Rc::new(Cell::new(SystemTime::UNIX_EPOCH)),
        }
    }

    /// Moves monotonic and wall-clock time forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
        self.wall.set(self.wall.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.now.get()
    }

    fn wall(&self) -> SystemTime {
        self.wall.get()
    }

    fn set_wall(&self, time: SystemTime) {
        self.wall.set(time);
    }
}

/// Symbolic identifiers of the timers used by the agent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TimerId {
    /// NAT inactivity timer, expiry triggers a rehandshake.
    NatKeepAlive,
    /// Delayed rehandshake attempt after a failed handshake.
    Rehandshake,
    /// Bound on the duration of a handshake the server does not answer.
    HandshakeTimeout,
    /// Delayed name resolution after a temporary failure.
    ResolveRetry,
    /// Delayed package download retry.
    DownloadRetry,
    /// Periodic step timer of the event loop.
    Step,
}

#[derive(Debug, Copy, Clone)]
struct Timer {
    deadline: Duration,
    period: Option<Duration>,
}

/// One-shot and periodic timers keyed by [TimerId].
///
/// Arming a timer that is already running replaces its deadline.
#[derive(Debug, Default)]
pub struct Timers {
    timers: BTreeMap<TimerId, Timer>,
}

impl Timers {
    pub fn new() -> Timers {
        Timers::default()
    }

    /// Arms `id` to fire once, `after` from `now`.
    pub fn arm_once(&mut self, id: TimerId, now: Duration, after: Duration) {
        debug!(timer = ?id, after_ms = after.as_millis() as u64, "arming one-shot timer");
        self.timers.insert(
            id,
            Timer {
                deadline: now + after,
                period: None,
            },
        );
    }

    /// Arms `id` to fire every `period`, starting `period` from `now`.
    pub fn arm_periodic(&mut self, id: TimerId, now: Duration, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        debug!(timer = ?id, period_ms = period.as_millis() as u64, "arming periodic timer");
        self.timers.insert(
            id,
            Timer {
                deadline: now + period,
                period: Some(period),
            },
        );
    }

    /// Stops `id`. Stopping a timer that is not running has no effect.
    pub fn stop(&mut self, id: TimerId) {
        if self.timers.remove(&id).is_some() {
            debug!(timer = ?id, "timer stopped");
        }
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Returns the deadline of `id`, if it is running.
    pub fn deadline(&self, id: TimerId) -> Option<Duration> {
        self.timers.get(&id).map(|t| t.deadline)
    }

    /// Returns the time left until the earliest deadline, or `None` if no timer is running.
    pub fn next_timeout(&self, now: Duration) -> Option<Duration> {
        self.timers
            .values()
            .map(|t| t.deadline.saturating_sub(now))
            .min()
    }

    /// Removes and returns all timers whose deadline has passed, ordered by deadline.
    ///
    /// Periodic timers are re-armed relative to their previous deadline.
    pub fn expire(&mut self, now: Duration) -> Vec<TimerId> {
        let mut fired: Vec<(Duration, TimerId)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, t)| (t.deadline, *id))
            .collect();
        fired.sort();
        for (previous, id) in &fired {
            let period = self.timers.remove(id).and_then(|t| t.period);
            if let Some(period) = period {
                let mut deadline = *previous + period;
                while deadline <= now {
                    deadline += period;
                }
                self.timers.insert(*id, Timer { deadline, period: Some(period) });
            }
        }
        fired.into_iter().map(|(_, id)| id).collect()
    }
}

/// Defers wall-clock jumps requested by the server until the response has been sent.
///
/// The new time is only applied from the post-request hook of the event loop, so the response
/// leaves with the DTLS timing it was produced with. The adjuster also holds the configured
/// clock sources the LwM2M core may synchronize the device time from.
#[derive(Debug, Default)]
pub struct ClockAdjuster {
    pending: Option<SystemTime>,
    sources: Vec<ClockSource>,
}

impl ClockAdjuster {
    pub fn new() -> ClockAdjuster {
        ClockAdjuster::default()
    }

    /// Creates an adjuster knowing `sources`, ordered by descending priority.
    pub fn with_sources(sources: Vec<ClockSource>) -> ClockAdjuster {
        ClockAdjuster { pending: None, sources }
    }

    /// Configured clock sources, by descending priority.
    pub fn sources(&self) -> &[ClockSource] {
        &self.sources
    }

    /// Clock source with the highest priority, if any is configured.
    pub fn preferred_source(&self) -> Option<&ClockSource> {
        self.sources.first()
    }

    /// Records the time requested by the server. A later request replaces an earlier one.
    pub fn set_device_current_time(&mut self, time: SystemTime) {
        debug!(?time, "device time change deferred to post-request hook");
        self.pending = Some(time);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Applies a pending clock jump. Returns `true` if the clock was changed.
    pub fn apply_post_request(&mut self, clock: &dyn Clock) -> bool {
        match self.pending.take() {
            Some(time) => {
                info!(?time, "applying device time change");
                clock.set_wall(time);
                true
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let mut timers = Timers::new();
        timers.arm_once(TimerId::NatKeepAlive, Duration::ZERO, Duration::from_secs(5));
        assert!(timers.expire(Duration::from_millis(4900)).is_empty());
        assert_eq!(timers.expire(Duration::from_secs(5)), vec![TimerId::NatKeepAlive]);
        assert!(!timers.is_running(TimerId::NatKeepAlive));
        assert!(timers.expire(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn periodic_rearms_after_expiry() {
        let mut timers = Timers::new();
        timers.arm_periodic(TimerId::Step, Duration::ZERO, Duration::from_secs(1));
        assert_eq!(timers.expire(Duration::from_millis(1500)), vec![TimerId::Step]);
        assert_eq!(timers.deadline(TimerId::Step), Some(Duration::from_secs(2)));
        assert_eq!(timers.next_timeout(Duration::from_millis(1500)), Some(Duration::from_millis(500)));
    }

    #[test]
    fn expiry_is_ordered_by_deadline() {
        let mut timers = Timers::new();
        timers.arm_once(TimerId::DownloadRetry, Duration::ZERO, Duration::from_secs(3));
        timers.arm_once(TimerId::NatKeepAlive, Duration::ZERO, Duration::from_secs(1));
        assert_eq!(
            timers.expire(Duration::from_secs(10)),
            vec![TimerId::NatKeepAlive, TimerId::DownloadRetry]
        );
    }

    #[test]
    fn clock_jump_waits_for_post_request_hook() {
        let clock = ManualClock::new();
        let mut adjuster = ClockAdjuster::new();
        let target = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        adjuster.set_device_current_time(target);
        assert_eq!(clock.wall(), SystemTime::UNIX_EPOCH);
        assert!(adjuster.apply_post_request(&clock));
        assert_eq!(clock.wall(), target);
        assert!(!adjuster.apply_post_request(&clock));
    }

    #[test]
    fn preferred_clock_source_has_highest_priority() {
        use crate::config::{ClockSourceKind, MemoryConfigTree};

        assert_eq!(ClockAdjuster::new().preferred_source(), None);
        let mut tree = MemoryConfigTree::new();
        tree.set("clockTime:/source/ntp/priority", "2");
        tree.set("clockTime:/source/ntp/config/1", "pool.ntp.org");
        tree.set("clockTime:/source/tp/priority", "1");
        let adjuster = ClockAdjuster::with_sources(ClockSource::load_all(&tree).unwrap());
        let preferred = adjuster.preferred_source().unwrap();
        assert_eq!(preferred.kind, ClockSourceKind::Ntp);
        assert_eq!(preferred.server.as_deref(), Some("pool.ntp.org"));
        assert_eq!(adjuster.sources().len(), 2);
    }
}
