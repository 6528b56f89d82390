// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * transport/mod.rs - Module file for the UDP transport.
 */

//! UDP transport of the agent.
//!
//! The transport owns the single UDP socket of the agent, registers it with the event loop's
//! readiness watcher and provides name resolution and route setup for outgoing connections.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub use resolve::{Resolver, SystemResolver};
pub use udp::{Connected, Datagram, SocketConfig, UdpTransport};

use crate::config::DataChannel;

mod resolve;
mod udp;

/// Maximum size of a datagram read from the socket.
pub const UDP_MAX_PACKET_SIZE: usize = 2048;

/// Address family used for the local socket and for name resolution.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    /// Either family, IPv6 is preferred.
    Unspec,
}

impl AddressFamily {
    /// Returns the raw `AF_*` value used by `getaddrinfo`.
    pub(crate) fn as_raw(&self) -> libc::c_int {
        match self {
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
            AddressFamily::Unspec => libc::AF_UNSPEC,
        }
    }

    /// Wildcard local addresses to try for this family, in order of preference.
    pub(crate) fn wildcard_candidates(&self, port: u16) -> Vec<SocketAddr> {
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
        match self {
            AddressFamily::Ipv4 => vec![v4],
            AddressFamily::Ipv6 => vec![v6],
            AddressFamily::Unspec => vec![v6, v4],
        }
    }
}

/// Active cellular data profile, used on builds that bind to the cellular interface.
pub trait CellularProfile {
    fn ipv4(&self) -> Option<Ipv4Addr>;

    fn ipv6(&self) -> Option<Ipv6Addr>;

    /// Returns the local address to bind to, IPv4 if the profile advertises one.
    fn local_address(&self) -> Option<IpAddr> {
        self.ipv4()
            .map(IpAddr::V4)
            .or_else(|| self.ipv6().map(IpAddr::V6))
    }
}

/// Data connection service of the platform.
pub trait DataConnection {
    /// Returns whether a default route is installed.
    fn has_default_route(&self) -> bool;

    /// Adds a route to `destination`, through the dedicated `channel` if one is configured.
    fn add_route(&mut self, destination: IpAddr, channel: Option<&DataChannel>) -> Result<(), String>;
}
