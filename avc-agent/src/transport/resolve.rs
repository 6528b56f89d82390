// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * transport/resolve.rs - Host name resolution.
 */

use std::{
    ffi::{CStr, CString},
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use tracing::debug;

use super::AddressFamily;
use crate::error::ResolveError;

/// Resolves a host name into the endpoints to try, in order.
pub trait Resolver {
    fn resolve(&self, host: &str, port: u16, family: AddressFamily) -> Result<Vec<SocketAddr>, ResolveError>;
}

/// Resolver using the system's `getaddrinfo`.
///
/// Each call performs a single lookup. An `EAI_AGAIN` answer is reported as
/// [ResolveError::TemporaryFailure], retrying it is up to the caller's event loop.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> SystemResolver {
        SystemResolver
    }
}

/// Raw failure of a single `getaddrinfo` call.
struct GaiFailure {
    code: libc::c_int,
    errno: io::Error,
}

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16, family: AddressFamily) -> Result<Vec<SocketAddr>, ResolveError> {
        let c_host = CString::new(host).map_err(|_e| ResolveError::InvalidHost)?;
        match getaddrinfo(&c_host, port, family) {
            Ok(addrs) if addrs.is_empty() => Err(ResolveError::NoAddress(host.to_string())),
            Ok(addrs) => {
                debug!(host, count = addrs.len(), "host resolved");
                Ok(addrs)
            },
            Err(failure) => Err(gai_error(host, failure)),
        }
    }
}

fn gai_error(host: &str, failure: GaiFailure) -> ResolveError {
    match failure.code {
        libc::EAI_AGAIN => {
            debug!(host, "name resolution temporarily failed");
            ResolveError::TemporaryFailure(host.to_string())
        },
        libc::EAI_SYSTEM => ResolveError::System(failure.errno),
        code => {
            // SAFETY: gai_strerror returns a pointer to a static, null-terminated string.
            let message = unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
                .to_string_lossy()
                .into_owned();
            ResolveError::Failed { code, message }
        },
    }
}

/// Performs a single `getaddrinfo` call for UDP endpoints of `host`.
fn getaddrinfo(host: &CStr, port: u16, family: AddressFamily) -> Result<Vec<SocketAddr>, GaiFailure> {
    // Port numbers never contain null bytes.
    let service = CString::new(port.to_string()).unwrap_or_default();
    // SAFETY: An all-zero addrinfo is a valid hints structure.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = family.as_raw();
    hints.ai_socktype = libc::SOCK_DGRAM;
    hints.ai_protocol = libc::IPPROTO_UDP;
    hints.ai_flags = libc::AI_NUMERICSERV;

    let mut result: *mut libc::addrinfo = std::ptr::null_mut();
    // SAFETY: host and service are valid null-terminated strings, hints is initialized and result
    // is a valid out-pointer.
    let code = unsafe { libc::getaddrinfo(host.as_ptr(), service.as_ptr(), &hints, &mut result) };
    if code != 0 {
        // errno must be read before anything else can overwrite it.
        let errno = io::Error::last_os_error();
        return Err(GaiFailure { code, errno });
    }

    let mut addrs = Vec::new();
    let mut current = result;
    while !current.is_null() {
        // SAFETY: current is a non-null element of the list returned by getaddrinfo, which stays
        // valid until freeaddrinfo is called.
        let entry = unsafe { &*current };
        // SAFETY: ai_addr points to a sockaddr of ai_addrlen bytes as reported by getaddrinfo.
        if let Some(addr) = unsafe { sockaddr_to_std(entry.ai_addr, entry.ai_addrlen) } {
            addrs.push(addr);
        }
        current = entry.ai_next;
    }
    // SAFETY: result was returned by a successful getaddrinfo call and is freed exactly once.
    unsafe { libc::freeaddrinfo(result) };
    Ok(addrs)
}

/// Converts a raw socket address into a [SocketAddr].
///
/// # Safety
/// `addr` must be null or point to a socket address of at least `len` bytes.
unsafe fn sockaddr_to_std(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    match (*addr).sa_family as libc::c_int {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let raw = &*(addr as *const libc::sockaddr_in);
            Some(
                SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr)),
                    u16::from_be(raw.sin_port),
                )
                .into(),
            )
        },
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let raw = &*(addr as *const libc::sockaddr_in6);
            Some(
                SocketAddrV6::new(
                    Ipv6Addr::from(raw.sin6_addr.s6_addr),
                    u16::from_be(raw.sin6_port),
                    raw.sin6_flowinfo,
                    raw.sin6_scope_id,
                )
                .into(),
            )
        },
        _ => None,
    }
}
