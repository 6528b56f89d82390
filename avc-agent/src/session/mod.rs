// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * session/mod.rs - DTLS session management.
 */

//! DTLS session.
//!
//! The record layer and handshake are implemented by a [DtlsEngine] collaborator. The session
//! keeps the handshake state, the security material and the traffic timestamps used by the NAT
//! keep-alive, and sends the engine's records through the [UdpTransport].

use std::{net::SocketAddr, time::Duration};

use tracing::{debug, info, warn};

#[cfg(feature = "dtls-psk")]
pub use psk::PskKey;

use crate::{
    backoff::Backoff,
    credentials::{CredentialId, CredentialStore},
    error::SessionError,
    transport::{Datagram, UdpTransport},
};

#[cfg(feature = "dtls-psk")]
mod psk;

/// State of the DTLS association.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HandshakeState {
    Idle,
    Handshaking,
    Established,
    /// Renegotiating an established association.
    Rehandshaking,
    Failed,
}

impl HandshakeState {
    pub fn is_handshaking(&self) -> bool {
        matches!(self, HandshakeState::Handshaking | HandshakeState::Rehandshaking)
    }
}

/// Server a session is opened to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerKind {
    Bootstrap,
    DeviceManagement,
}

impl ServerKind {
    /// Credential holding the PSK identity or device public key.
    pub fn public_key(&self) -> CredentialId {
        match self {
            ServerKind::Bootstrap => CredentialId::BsPublicKey,
            ServerKind::DeviceManagement => CredentialId::DmPublicKey,
        }
    }

    /// Credential holding the PSK or device private key.
    pub fn secret_key(&self) -> CredentialId {
        match self {
            ServerKind::Bootstrap => CredentialId::BsSecretKey,
            ServerKind::DeviceManagement => CredentialId::DmSecretKey,
        }
    }

    /// Credential holding the server public key.
    pub fn server_public_key(&self) -> CredentialId {
        match self {
            ServerKind::Bootstrap => CredentialId::BsServerPublicKey,
            ServerKind::DeviceManagement => CredentialId::DmServerPublicKey,
        }
    }

    /// Credential holding the server URI.
    pub fn address(&self) -> CredentialId {
        match self {
            ServerKind::Bootstrap => CredentialId::BsAddress,
            ServerKind::DeviceManagement => CredentialId::DmAddress,
        }
    }
}

/// Security material of a DTLS association.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SecurityMaterial {
    #[cfg(feature = "dtls-psk")]
    Psk(PskKey),
    #[cfg(feature = "dtls-pki")]
    Certificate {
        /// Device certificate.
        certificate: Vec<u8>,
        /// Device private key.
        private_key: Vec<u8>,
        /// Public key the server has to present.
        server_public_key: Vec<u8>,
    },
}

impl SecurityMaterial {
    /// Loads the security material for `server` from the credential store.
    ///
    /// Certificate-based material is used if a device certificate and a server public key are
    /// provisioned, pre-shared keys otherwise.
    pub fn load(credentials: &CredentialStore, server: ServerKind) -> Result<SecurityMaterial, SessionError> {
        #[cfg(feature = "dtls-pki")]
        {
            let certificate = credentials.get(CredentialId::Certificate)?;
            let server_public_key = credentials.get(server.server_public_key())?;
            if !certificate.is_empty() && !server_public_key.is_empty() {
                let private_key = credentials.get(server.secret_key())?;
                if private_key.is_empty() {
                    return Err(SessionError::MissingCredential(server.secret_key()));
                }
                debug!(?server, "using certificate-based security");
                return Ok(SecurityMaterial::Certificate {
                    certificate,
                    private_key,
                    server_public_key,
                });
            }
        }
        load_psk(credentials, server)
    }
}

#[cfg(feature = "dtls-psk")]
fn load_psk(credentials: &CredentialStore, server: ServerKind) -> Result<SecurityMaterial, SessionError> {
    let identity = credentials.get(server.public_key())?;
    if identity.is_empty() {
        return Err(SessionError::MissingCredential(server.public_key()));
    }
    let key = credentials.get(server.secret_key())?;
    if key.is_empty() {
        return Err(SessionError::MissingCredential(server.secret_key()));
    }
    debug!(?server, "using pre-shared key security");
    Ok(SecurityMaterial::Psk(PskKey::new(Some(identity), key)))
}

#[cfg(not(feature = "dtls-psk"))]
fn load_psk(_credentials: &CredentialStore, server: ServerKind) -> Result<SecurityMaterial, SessionError> {
    Err(SessionError::MissingCredential(server.secret_key()))
}

/// Result of feeding a record into the [DtlsEngine].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct EngineOutput {
    /// Records to send to the peer.
    pub outgoing: Vec<Vec<u8>>,
    /// Decrypted application data.
    pub plaintext: Option<Vec<u8>>,
    /// Set once a handshake finished, `true` on success.
    pub handshake_complete: Option<bool>,
}

/// DTLS record layer and handshake implementation.
pub trait DtlsEngine {
    /// Starts a handshake, returning the records to send.
    ///
    /// `renegotiate` is set when an established association is renegotiated, `force_new_keys`
    /// when the session must not be resumed with the previous keys.
    fn start_handshake(
        &mut self,
        security: &SecurityMaterial,
        renegotiate: bool,
        force_new_keys: bool,
    ) -> Result<Vec<Vec<u8>>, String>;

    /// Protects application data into a record.
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, String>;

    /// Processes a record received from the peer.
    fn process(&mut self, record: &[u8]) -> Result<EngineOutput, String>;

    /// Drops all association state.
    fn reset(&mut self) {}
}

/// Outcome of [DtlsSession::receive].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Received {
    pub plaintext: Option<Vec<u8>>,
    /// Set once a handshake finished, `true` on success.
    pub handshake_complete: Option<bool>,
}

/// The DTLS association of the agent with its server.
pub struct DtlsSession {
    engine: Box<dyn DtlsEngine>,
    state: HandshakeState,
    peer: Option<SocketAddr>,
    security: Option<SecurityMaterial>,
    last_rx: Option<Duration>,
    last_tx: Option<Duration>,
    backoff: Backoff,
    retry_at: Option<Duration>,
}

impl std::fmt::Debug for DtlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsSession")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("last_rx", &self.last_rx)
            .field("last_tx", &self.last_tx)
            .finish_non_exhaustive()
    }
}

impl DtlsSession {
    pub fn new(engine: Box<dyn DtlsEngine>) -> DtlsSession {
        DtlsSession {
            engine,
            state: HandshakeState::Idle,
            peer: None,
            security: None,
            last_rx: None,
            last_tx: None,
            backoff: Backoff::default(),
            retry_at: None,
        }
    }

    /// Replaces the rehandshake back-off.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Time of the last datagram received from the peer.
    pub fn last_rx_time(&self) -> Option<Duration> {
        self.last_rx
    }

    /// Time of the last datagram sent to the peer.
    pub fn last_tx_time(&self) -> Option<Duration> {
        self.last_tx
    }

    /// Earliest time of the next handshake attempt after a failure.
    pub fn retry_at(&self) -> Option<Duration> {
        self.retry_at
    }

    /// Sets the peer and security material of the next handshake, dropping any association.
    pub fn configure(&mut self, peer: SocketAddr, security: SecurityMaterial) {
        self.engine.reset();
        self.peer = Some(peer);
        self.security = Some(security);
        self.state = HandshakeState::Idle;
        self.retry_at = None;
        self.backoff.reset();
    }

    /// Starts the initial handshake.
    pub fn handshake(&mut self, transport: &UdpTransport, now: Duration) -> Result<(), SessionError> {
        if self.state.is_handshaking() {
            return Err(SessionError::HandshakeInProgress);
        }
        self.begin(transport, now, false, false)
    }

    /// Renegotiates the association, or starts a new handshake if none is established.
    ///
    /// After a failed handshake, attempts are refused until the back-off delay has elapsed.
    pub fn rehandshake(&mut self, transport: &UdpTransport, now: Duration, force_new_keys: bool) -> Result<(), SessionError> {
        if self.state.is_handshaking() {
            return Err(SessionError::HandshakeInProgress);
        }
        if let Some(retry_at) = self.retry_at.filter(|at| *at > now) {
            return Err(SessionError::BackingOff(retry_at - now));
        }
        let renegotiate = self.state == HandshakeState::Established;
        self.begin(transport, now, renegotiate, force_new_keys)
    }

    fn begin(
        &mut self,
        transport: &UdpTransport,
        now: Duration,
        renegotiate: bool,
        force_new_keys: bool,
    ) -> Result<(), SessionError> {
        let (Some(peer), Some(security)) = (self.peer, self.security.as_ref()) else {
            return Err(SessionError::NotEstablished(self.state));
        };
        let records = match self.engine.start_handshake(security, renegotiate, force_new_keys) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "unable to start handshake");
                self.on_handshake_complete(false, now);
                return Err(SessionError::Engine(e));
            },
        };
        self.state = if renegotiate {
            HandshakeState::Rehandshaking
        } else {
            HandshakeState::Handshaking
        };
        info!(%peer, renegotiate, force_new_keys, "DTLS handshake started");
        for record in records {
            if let Err(e) = transport.send(&record, peer) {
                self.on_handshake_complete(false, now);
                return Err(e.into());
            }
            self.last_tx = Some(now);
        }
        Ok(())
    }

    /// Records the outcome of a handshake.
    ///
    /// Returns the back-off delay before the next attempt after a failure.
    pub fn on_handshake_complete(&mut self, success: bool, now: Duration) -> Option<Duration> {
        if success {
            self.state = HandshakeState::Established;
            self.retry_at = None;
            self.backoff.reset();
            info!(peer = ?self.peer, "DTLS session established");
            None
        } else {
            self.state = HandshakeState::Failed;
            let delay = self.backoff.next_delay();
            self.retry_at = Some(now + delay);
            warn!(delay_ms = delay.as_millis() as u64, "DTLS handshake failed");
            Some(delay)
        }
    }

    /// Fails a handshake the peer did not complete in time.
    ///
    /// The engine state of the attempt is dropped and the back-off delay before the next attempt
    /// is returned. Returns `None` if no handshake is running.
    pub fn on_handshake_timeout(&mut self, now: Duration) -> Option<Duration> {
        if !self.state.is_handshaking() {
            return None;
        }
        warn!(peer = ?self.peer, state = ?self.state, "DTLS handshake timed out");
        self.engine.reset();
        self.on_handshake_complete(false, now)
    }

    /// Encrypts and sends application data.
    pub fn send(&mut self, transport: &UdpTransport, plaintext: &[u8], now: Duration) -> Result<usize, SessionError> {
        if !matches!(self.state, HandshakeState::Established | HandshakeState::Rehandshaking) {
            return Err(SessionError::NotEstablished(self.state));
        }
        let peer = self.peer.ok_or(SessionError::NotEstablished(self.state))?;
        let record = self.engine.encrypt(plaintext).map_err(SessionError::Engine)?;
        let sent = transport.send(&record, peer)?;
        self.last_tx = Some(now);
        Ok(sent)
    }

    /// Processes a datagram received on the transport.
    ///
    /// Datagrams from other sources than the peer are ignored.
    pub fn receive(&mut self, transport: &UdpTransport, datagram: &Datagram, now: Duration) -> Result<Received, SessionError> {
        if self.peer != Some(datagram.from) {
            debug!(from = %datagram.from, "ignoring datagram from unknown source");
            return Ok(Received::default());
        }
        let output = match self.engine.process(&datagram.data) {
            Ok(output) => output,
            Err(e) => {
                if self.state.is_handshaking() {
                    self.on_handshake_complete(false, now);
                    return Ok(Received {
                        plaintext: None,
                        handshake_complete: Some(false),
                    });
                }
                return Err(SessionError::Engine(e));
            },
        };
        self.last_rx = Some(now);
        if let Some(peer) = self.peer {
            for record in &output.outgoing {
                transport.send(record, peer)?;
                self.last_tx = Some(now);
            }
        }
        if let Some(success) = output.handshake_complete {
            self.on_handshake_complete(success, now);
        }
        Ok(Received {
            plaintext: output.plaintext,
            handshake_complete: output.handshake_complete,
        })
    }

    /// Drops the association.
    pub fn close(&mut self) {
        self.engine.reset();
        self.state = HandshakeState::Idle;
        self.retry_at = None;
        debug!("DTLS session closed");
    }
}

#[cfg(all(test, feature = "dtls-psk"))]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::credentials::MemoryStorage;

    #[test]
    fn psk_material_requires_both_credentials() {
        let credentials = CredentialStore::new(Rc::new(MemoryStorage::new()));
        credentials.set(CredentialId::DmPublicKey, b"urn:imei:0123").unwrap();
        assert!(matches!(
            SecurityMaterial::load(&credentials, ServerKind::DeviceManagement),
            Err(SessionError::MissingCredential(CredentialId::DmSecretKey))
        ));
        credentials.set(CredentialId::DmSecretKey, &[1, 2, 3]).unwrap();
        let material = SecurityMaterial::load(&credentials, ServerKind::DeviceManagement).unwrap();
        assert_eq!(material, SecurityMaterial::Psk(PskKey::new(Some("urn:imei:0123"), vec![1, 2, 3])));
    }

    #[cfg(feature = "dtls-pki")]
    #[test]
    fn certificate_preferred_when_provisioned() {
        let credentials = CredentialStore::new(Rc::new(MemoryStorage::new()));
        credentials.set(CredentialId::BsPublicKey, b"id").unwrap();
        credentials.set(CredentialId::BsSecretKey, b"key").unwrap();
        credentials.set(CredentialId::Certificate, b"cert").unwrap();
        credentials.set(CredentialId::BsServerPublicKey, b"server").unwrap();
        assert!(matches!(
            SecurityMaterial::load(&credentials, ServerKind::Bootstrap).unwrap(),
            SecurityMaterial::Certificate { .. }
        ));
    }
}
