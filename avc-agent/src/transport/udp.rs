// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * transport/udp.rs - UDP socket lifecycle.
 */

use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use super::{AddressFamily, CellularProfile, DataConnection, Resolver, UDP_MAX_PACKET_SIZE};
use crate::{config::AgentConfig, error::TransportError};

/// Configuration of the socket that is currently alive.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub family: AddressFamily,
    pub socket_type: Type,
    pub protocol: Protocol,
    /// Address the socket is bound to.
    pub local_addr: SocketAddr,
}

/// A datagram read from the socket.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// The single UDP socket of the agent.
///
/// At most one socket is alive at any time, `open` fails with [TransportError::AlreadyOpen]
/// otherwise.
#[derive(Debug)]
pub struct UdpTransport {
    token: Token,
    socket: Option<mio::net::UdpSocket>,
    config: Option<SocketConfig>,
}

impl UdpTransport {
    /// Creates a closed transport that will register its socket under `token`.
    pub fn new(token: Token) -> UdpTransport {
        UdpTransport {
            token,
            socket: None,
            config: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Returns the configuration of the alive socket.
    pub fn socket_config(&self) -> Option<&SocketConfig> {
        self.config.as_ref()
    }

    /// Creates, binds and registers the socket.
    ///
    /// The local address is the address of `profile` on builds that bind to the cellular
    /// interface, the wildcard address of the configured family otherwise. The first candidate
    /// that accepts `SO_REUSEADDR` and binds is used.
    pub fn open(
        &mut self,
        registry: &Registry,
        config: &AgentConfig,
        profile: Option<&dyn CellularProfile>,
    ) -> Result<SocketAddr, TransportError> {
        if self.socket.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        let candidates = if config.bind_to_cellular_profile {
            let address = profile
                .and_then(|p| p.local_address())
                .ok_or(TransportError::NoProfileAddress)?;
            vec![SocketAddr::new(address, config.local_port)]
        } else {
            config.family.wildcard_candidates(config.local_port)
        };

        let (socket, local_addr) = candidates
            .iter()
            .find_map(|candidate| match bind_candidate(candidate) {
                Ok(socket) => Some((socket, *candidate)),
                Err(e) => {
                    debug!(%candidate, error = %e, "unable to bind local address candidate");
                    None
                },
            })
            .ok_or(TransportError::NoBindCandidate)?;
        // The actual port differs from the configured one if port 0 was requested.
        let local_addr = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(local_addr);

        let mut socket = mio::net::UdpSocket::from_std(socket.into());
        registry.register(&mut socket, self.token, Interest::READABLE)?;
        info!(%local_addr, "UDP socket open");

        self.config = Some(SocketConfig {
            family: config.family,
            socket_type: Type::DGRAM,
            protocol: Protocol::UDP,
            local_addr,
        });
        self.socket = Some(socket);
        Ok(local_addr)
    }

    /// Deregisters and closes the socket.
    pub fn close(&mut self, registry: &Registry) -> Result<(), TransportError> {
        let mut socket = self.socket.take().ok_or(TransportError::NotOpen)?;
        self.config = None;
        if let Err(e) = registry.deregister(&mut socket) {
            warn!(error = %e, "unable to deregister UDP socket");
        }
        info!("UDP socket closed");
        Ok(())
    }

    /// Resolves `host` and connects the socket to the first endpoint that accepts.
    ///
    /// If no default route is installed, `data_connection` is asked to add a route to the peer,
    /// through the dedicated data channel if `config` names one.
    pub fn connect(
        &self,
        resolver: &dyn Resolver,
        data_connection: &mut dyn DataConnection,
        config: &AgentConfig,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<Connected, TransportError> {
        let (socket, local_addr) = match (self.socket.as_ref(), self.config.as_ref()) {
            (Some(socket), Some(socket_config)) => (socket, socket_config.local_addr),
            _ => return Err(TransportError::NotOpen),
        };
        let endpoints = resolver.resolve(host, port, family)?;
        let peer = endpoints
            .into_iter()
            .map(|endpoint| peer_for_local(&local_addr, endpoint))
            .find(|peer| match socket.connect(*peer) {
                Ok(()) => true,
                Err(e) => {
                    debug!(%peer, error = %e, "connect attempt failed");
                    false
                },
            })
            .ok_or_else(|| TransportError::ConnectFailed(host.to_string()))?;

        if !data_connection.has_default_route() {
            data_connection
                .add_route(peer.ip(), config.data_channel.as_ref())
                .map_err(TransportError::Route)?;
            info!(%peer, "route added for DM server");
        }
        Ok(Connected { peer, local_addr })
    }

    /// Sends `buf` to `dest`, returning the number of bytes written.
    pub fn send(&self, buf: &[u8], dest: SocketAddr) -> Result<usize, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        Ok(socket.send_to(buf, dest)?)
    }

    /// Reads a single datagram from the socket.
    ///
    /// Returns `None` if nothing is pending, if the socket is closed (`EBADF`), or if the read
    /// failed for another reason, which is logged.
    pub fn drain_once(&self) -> Option<Datagram> {
        let socket = self.socket.as_ref()?;
        let mut buf = [0u8; UDP_MAX_PACKET_SIZE];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    return Some(Datagram {
                        data: buf[..len].to_vec(),
                        from,
                    })
                },
                // ICMP port unreachable reported on the connected socket.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => debug!("peer port unreachable"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => return None,
                Err(e) => {
                    warn!(error = %e, "UDP read failed");
                    return None;
                },
            }
        }
    }
}

fn bind_candidate(candidate: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*candidate), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(*candidate))?;
    Ok(socket)
}

/// Peer the transport socket was connected to by [UdpTransport::connect].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Connected {
    /// Address of the peer as seen by the local socket.
    pub peer: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Returns `peer` in the form a socket bound to `local` can reach it.
///
/// IPv4 peers are mapped into IPv6 for a dual-stack IPv6 socket.
fn peer_for_local(local: &SocketAddr, peer: SocketAddr) -> SocketAddr {
    match (local, peer) {
        (SocketAddr::V6(_), SocketAddr::V4(v4)) => SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()),
        _ => peer,
    }
}
