// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * keepalive.rs - NAT inactivity timer.
 */

//! NAT keep-alive.
//!
//! NAT bindings for UDP flows time out after a period of inactivity, after which the DTLS
//! association can no longer be reached from the server. The keep-alive timer is re-armed on
//! every datagram and renegotiates the session once it expires.

use std::time::Duration;

use tracing::{debug, info};

use crate::{
    error::ConfigError,
    time::{TimerId, Timers},
};

/// Default NAT inactivity timeout.
pub const DEFAULT_NAT_TIMEOUT: Duration = Duration::from_secs(40);
/// Short NAT inactivity timeout for networks with aggressive NAT binding expiry.
pub const SHORT_NAT_TIMEOUT: Duration = Duration::from_secs(5);

/// The NAT inactivity timer.
///
/// The timer itself lives in [Timers] under [TimerId::NatKeepAlive], this type tracks whether it
/// should be running and for how long.
#[derive(Debug, Clone)]
pub struct NatKeepAlive {
    inactivity: Duration,
    running: bool,
}

impl NatKeepAlive {
    pub fn new(inactivity: Duration) -> NatKeepAlive {
        NatKeepAlive {
            inactivity,
            running: false,
        }
    }

    pub fn inactivity(&self) -> Duration {
        self.inactivity
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Changes the inactivity timeout. A running timer is re-armed with the new value.
    ///
    /// # Errors
    /// Returns [ConfigError::ZeroNatTimeout] for a timeout of zero seconds.
    pub fn set_nat_timeout(&mut self, timers: &mut Timers, now: Duration, seconds: u32) -> Result<(), ConfigError> {
        if seconds == 0 {
            return Err(ConfigError::ZeroNatTimeout);
        }
        self.inactivity = Duration::from_secs(seconds.into());
        info!(seconds, "NAT timeout changed");
        if self.running {
            timers.arm_once(TimerId::NatKeepAlive, now, self.inactivity);
        }
        Ok(())
    }

    /// Starts the timer, called when a handshake completes.
    pub fn start(&mut self, timers: &mut Timers, now: Duration) {
        self.running = true;
        timers.arm_once(TimerId::NatKeepAlive, now, self.inactivity);
    }

    /// Stops the timer, called when a handshake starts and when the session closes.
    pub fn stop(&mut self, timers: &mut Timers) {
        self.running = false;
        timers.stop(TimerId::NatKeepAlive);
    }

    /// Postpones expiry after a datagram was sent or received.
    pub fn on_traffic(&mut self, timers: &mut Timers, now: Duration) {
        if self.running {
            timers.arm_once(TimerId::NatKeepAlive, now, self.inactivity);
        }
    }

    /// Handles expiry of the timer. Returns `true` if a rehandshake should be initiated.
    ///
    /// The timer stays stopped until the rehandshake completes and [NatKeepAlive::start] is
    /// called again.
    pub fn on_expired(&mut self) -> bool {
        if !self.running {
            debug!("ignoring expiry of stopped NAT timer");
            return false;
        }
        self.running = false;
        info!(
            inactivity_s = self.inactivity.as_secs(),
            "NAT inactivity timeout expired, renegotiating session"
        );
        true
    }
}

impl Default for NatKeepAlive {
    fn default() -> Self {
        NatKeepAlive::new(DEFAULT_NAT_TIMEOUT)
    }
}
