// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * error.rs - Status codes and error types.
 */

//! Error types and the status code reported to the LwM2M core.
//!
//! Every component has its own error enum. All of them can be converted into a [Status], which
//! is the single sum type the LwM2M core matches on.

use std::{fmt::Display, io, path::PathBuf};

use thiserror::Error;

use crate::{
    credentials::CredentialId, download::DownloadState, integrity::PackageType, session::HandshakeState,
};

/// Status reported to the callers of the agent core.
///
/// Absent credentials and files are not an error kind: they are returned as [Status::Ok] with an
/// empty value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Status {
    /// Operation completed, output values are valid.
    Ok,
    /// Unspecified failure, typically a storage error on a read-only check.
    GeneralError,
    /// Missing buffer, unknown enum value or out-of-range size.
    InvalidArg,
    /// Operation attempted in the wrong lifecycle state.
    InvalidState,
    /// Output buffer too small.
    Overflow,
    /// Value outside the range accepted by the operation.
    IncorrectRange,
    /// Operation is not implemented on this device.
    NotImplemented,
    /// Operation is not supported at this layer.
    OpNotSupported,
    /// Signature check failed, digest mismatch or key parse failure.
    IntegrityFailure,
    /// Network, DNS or DTLS handshake failure that may be retried.
    Transient,
    /// Storage failure on a write path, the current operation was aborted.
    Fatal,
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Ok => "OK",
            Status::GeneralError => "GENERAL_ERROR",
            Status::InvalidArg => "INVALID_ARG",
            Status::InvalidState => "INVALID_STATE",
            Status::Overflow => "OVERFLOW",
            Status::IncorrectRange => "INCORRECT_RANGE",
            Status::NotImplemented => "NOT_IMPLEMENTED",
            Status::OpNotSupported => "OP_NOT_SUPPORTED",
            Status::IntegrityFailure => "INTEGRITY_FAILURE",
            Status::Transient => "TRANSIENT",
            Status::Fatal => "FATAL",
        })
    }
}

impl<T, E> From<&Result<T, E>> for Status
where
    for<'a> Status: From<&'a E>,
{
    fn from(value: &Result<T, E>) -> Self {
        match value {
            Ok(_) => Status::Ok,
            Err(e) => <Status as From<&E>>::from(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    /// Resolver answered `EAI_AGAIN`.
    #[error("DNS resolution error: temporary failure for host {0}")]
    TemporaryFailure(String),
    /// Resolver reported `EAI_SYSTEM`, the preserved `errno` is the source.
    #[error("DNS resolution error: system error")]
    System(#[source] io::Error),
    /// Any other `getaddrinfo` failure.
    #[error("DNS resolution error: {message} (code {code})")]
    Failed { code: i32, message: String },
    /// Host name contains a null byte.
    #[error("DNS resolution error: host name contains a null byte")]
    InvalidHost,
    /// Resolution succeeded but produced no usable address.
    #[error("DNS resolution error: no address for host {0}")]
    NoAddress(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// Operation requires an open socket.
    #[error("UDP transport error: socket is not open")]
    NotOpen,
    /// `open` was called while a socket is already alive.
    #[error("UDP transport error: socket is already open")]
    AlreadyOpen,
    /// None of the local address candidates could be bound.
    #[error("UDP transport error: no local address candidate could be bound")]
    NoBindCandidate,
    /// Cellular profile did not advertise any address for the bound-to-interface build.
    #[error("UDP transport error: active cellular profile has no address")]
    NoProfileAddress,
    /// None of the resolved endpoints accepted a connection.
    #[error("UDP transport error: unable to connect to {0}")]
    ConnectFailed(String),
    /// Host name resolution failed.
    #[error("UDP transport error: {0}")]
    Resolve(#[from] ResolveError),
    /// Data connection collaborator refused to install a route.
    #[error("UDP transport error: unable to add route: {0}")]
    Route(String),
    /// Socket-level I/O failure.
    #[error("UDP transport error: I/O failure")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation requires an established association.
    #[error("DTLS session error: not established (state {0:?})")]
    NotEstablished(HandshakeState),
    /// A handshake is already running.
    #[error("DTLS session error: handshake already in progress")]
    HandshakeInProgress,
    /// Back-off delay since the last failed attempt has not elapsed yet.
    #[error("DTLS session error: rehandshake backing off for {0:?}")]
    BackingOff(std::time::Duration),
    /// The DTLS engine failed.
    #[error("DTLS session error: engine failure: {0}")]
    Engine(String),
    /// Required credential is not provisioned.
    #[error("DTLS session error: credential {0} is not provisioned")]
    MissingCredential(CredentialId),
    /// Credential store failure while loading the security material.
    #[error("DTLS session error: {0}")]
    Credential(#[from] CredentialError),
    /// Underlying transport failure.
    #[error("DTLS session error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum CredentialError {
    /// Payload exceeds the cap for this credential.
    #[error("credential error: {id} payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge { id: CredentialId, len: usize, max: usize },
    /// Certificate length outside of `0..=4000`.
    #[error("credential error: certificate length {0} out of range")]
    CertificateOutOfRange(usize),
    /// Output buffer cannot hold the stored value.
    #[error("credential error: buffer of {available} bytes too small for {needed} bytes")]
    Overflow { needed: usize, available: usize },
    /// Numeric id does not name a credential.
    #[error("credential error: unknown credential id {0}")]
    UnknownId(u32),
    /// PEM lay-out failed.
    #[error("credential error: {0}")]
    Pem(#[from] PemError),
    /// Secure storage failure.
    #[error("credential error: storage failure on {id}")]
    Storage {
        id: CredentialId,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum PemError {
    /// Output buffer cannot hold the PEM document.
    #[error("PEM lay-out error: buffer of {available} bytes too small for {needed} bytes")]
    BufferTooSmall { needed: usize, available: usize },
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum DigestError {
    /// No digest context has been started.
    #[error("SHA-1 error: no digest context")]
    NoContext,
    /// A digest context is already running.
    #[error("SHA-1 error: a digest context is already active")]
    AlreadyActive,
    /// Checkpoint bytes have the wrong length, version or inconsistent content.
    #[error("SHA-1 error: invalid checkpoint")]
    InvalidCheckpoint,
    /// Output buffer too small for the checkpoint.
    #[error("SHA-1 error: buffer of {available} bytes too small for {needed} byte checkpoint")]
    Overflow { needed: usize, available: usize },
}

#[derive(Error, Debug)]
pub enum IntegrityError {
    /// The verification key for this package type is not provisioned.
    #[error("package integrity error: no key provisioned for {0:?} packages")]
    KeyMissing(PackageType),
    /// The provisioned key is neither an SPKI nor a PKCS#1 RSA public key.
    #[error("package integrity error: unable to parse RSA public key")]
    KeyParse,
    /// Signature does not match the digest.
    #[error("package integrity error: signature verification failed")]
    BadSignature,
    /// Kernel command line lacks a required token.
    #[error("package integrity error: kernel command line lacks {0}")]
    CmdlineToken(String),
    /// Digest context failure.
    #[error("package integrity error: {0}")]
    Digest(#[from] DigestError),
    /// Credential store failure while loading the key.
    #[error("package integrity error: {0}")]
    Credential(#[from] CredentialError),
}

#[derive(Error, Debug)]
pub enum UpdateStoreError {
    /// Writing an update-state file failed, nothing is known to have been persisted.
    #[error("update state error: unable to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Removing a persisted file failed.
    #[error("update state error: unable to remove {path}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum DownloadError {
    /// Package URI cannot be parsed or uses an unsupported scheme.
    #[error("package download error: invalid package URI {0:?}")]
    InvalidUri(String),
    /// Operation not allowed in the current state.
    #[error("package download error: operation invalid in state {0:?}")]
    InvalidState(DownloadState),
    /// `receive_data` was called without a buffer.
    #[error("package download error: missing data buffer")]
    MissingBuffer,
    /// More bytes were received than announced.
    #[error("package download error: received {received} bytes for a {size} byte package")]
    Oversized { received: u64, size: u64 },
    /// Downloader collaborator failed to start or resume the fetch.
    #[error("package download error: downloader failure: {0}")]
    Downloader(String),
    /// Package verification failed.
    #[error("package download error: {0}")]
    Integrity(#[from] IntegrityError),
    /// Update state could not be persisted.
    #[error("package download error: {0}")]
    UpdateStore(#[from] UpdateStoreError),
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ChannelError {
    /// Another push is still waiting for its acknowledgement.
    #[error("CoAP channel error: a push is already in progress")]
    PushInProgress,
    /// Payload exceeds the stream buffer.
    #[error("CoAP channel error: payload of {len} bytes exceeds the {max} byte stream buffer")]
    PayloadTooLarge { len: usize, max: usize },
    /// Push payload is empty.
    #[error("CoAP channel error: empty push payload")]
    EmptyPayload,
    /// The LwM2M core refused to send a message.
    #[error("CoAP channel error: unable to send: {0}")]
    Send(String),
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// A config tree value has the wrong type or an out-of-range value.
    #[error("configuration error: invalid value {value:?} at {path}")]
    InvalidValue { path: String, value: String },
    /// NAT timeout must be positive.
    #[error("configuration error: NAT timeout must be at least one second")]
    ZeroNatTimeout,
    /// Handshake timeout must be at least one second.
    #[error("configuration error: invalid handshake timeout {0:?}")]
    InvalidHandshakeTimeout(std::time::Duration),
    /// Maximum CoAP payload must be a valid block size.
    #[error("configuration error: invalid maximum CoAP payload {0}")]
    InvalidPayloadSize(usize),
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum PlatformError {
    /// Formatted value does not fit the fixed capacity.
    #[error("platform error: {needed} bytes do not fit into {capacity} bytes")]
    Overflow { needed: usize, capacity: usize },
}

#[derive(Error, Debug)]
pub enum AgentError {
    /// Readiness watcher could not be created or polled.
    #[error("agent error: poll failure")]
    Poll(#[source] io::Error),
    /// Server URI stored in the credential store cannot be used.
    #[error("agent error: invalid server address {0:?}")]
    InvalidServerAddress(String),
    #[error("agent error: {0}")]
    Transport(#[from] TransportError),
    #[error("agent error: {0}")]
    Session(#[from] SessionError),
    #[error("agent error: {0}")]
    Credential(#[from] CredentialError),
    #[error("agent error: {0}")]
    Download(#[from] DownloadError),
    #[error("agent error: {0}")]
    Channel(#[from] ChannelError),
}

impl From<&ResolveError> for Status {
    fn from(_value: &ResolveError) -> Self {
        Status::Transient
    }
}

impl From<&TransportError> for Status {
    fn from(value: &TransportError) -> Self {
        match value {
            TransportError::NotOpen | TransportError::AlreadyOpen => Status::InvalidState,
            TransportError::NoBindCandidate | TransportError::NoProfileAddress | TransportError::Io(_) => {
                Status::GeneralError
            },
            TransportError::ConnectFailed(_) | TransportError::Resolve(_) | TransportError::Route(_) => {
                Status::Transient
            },
        }
    }
}

impl From<&SessionError> for Status {
    fn from(value: &SessionError) -> Self {
        match value {
            SessionError::NotEstablished(_) | SessionError::HandshakeInProgress => Status::InvalidState,
            SessionError::BackingOff(_) | SessionError::Engine(_) => Status::Transient,
            SessionError::MissingCredential(_) => Status::InvalidState,
            SessionError::Credential(e) => e.into(),
            SessionError::Transport(e) => e.into(),
        }
    }
}

impl From<&CredentialError> for Status {
    fn from(value: &CredentialError) -> Self {
        match value {
            CredentialError::TooLarge { .. } | CredentialError::UnknownId(_) => Status::InvalidArg,
            CredentialError::CertificateOutOfRange(_) => Status::IncorrectRange,
            CredentialError::Overflow { .. } => Status::Overflow,
            CredentialError::Pem(e) => e.into(),
            CredentialError::Storage { .. } => Status::GeneralError,
        }
    }
}

impl From<&PemError> for Status {
    fn from(_value: &PemError) -> Self {
        Status::Overflow
    }
}

impl From<&DigestError> for Status {
    fn from(value: &DigestError) -> Self {
        match value {
            DigestError::NoContext | DigestError::AlreadyActive => Status::InvalidState,
            DigestError::InvalidCheckpoint => Status::IntegrityFailure,
            DigestError::Overflow { .. } => Status::Overflow,
        }
    }
}

impl From<&IntegrityError> for Status {
    fn from(value: &IntegrityError) -> Self {
        match value {
            IntegrityError::Digest(e) => e.into(),
            IntegrityError::Credential(e) => e.into(),
            _ => Status::IntegrityFailure,
        }
    }
}

impl From<&UpdateStoreError> for Status {
    fn from(_value: &UpdateStoreError) -> Self {
        Status::Fatal
    }
}

impl From<&DownloadError> for Status {
    fn from(value: &DownloadError) -> Self {
        match value {
            DownloadError::InvalidUri(_) | DownloadError::MissingBuffer => Status::InvalidArg,
            DownloadError::InvalidState(_) => Status::InvalidState,
            DownloadError::Oversized { .. } => Status::Overflow,
            DownloadError::Downloader(_) => Status::Transient,
            DownloadError::Integrity(e) => e.into(),
            DownloadError::UpdateStore(e) => e.into(),
        }
    }
}

impl From<&ChannelError> for Status {
    fn from(value: &ChannelError) -> Self {
        match value {
            ChannelError::PushInProgress => Status::InvalidState,
            ChannelError::PayloadTooLarge { .. } => Status::Overflow,
            ChannelError::EmptyPayload => Status::InvalidArg,
            ChannelError::Send(_) => Status::GeneralError,
        }
    }
}

impl From<&ConfigError> for Status {
    fn from(_value: &ConfigError) -> Self {
        Status::InvalidArg
    }
}

impl From<&AgentError> for Status {
    fn from(value: &AgentError) -> Self {
        match value {
            AgentError::Poll(_) => Status::GeneralError,
            AgentError::InvalidServerAddress(_) => Status::InvalidArg,
            AgentError::Transport(e) => e.into(),
            AgentError::Session(e) => e.into(),
            AgentError::Credential(e) => e.into(),
            AgentError::Download(e) => e.into(),
            AgentError::Channel(e) => e.into(),
        }
    }
}

impl From<&PlatformError> for Status {
    fn from(_value: &PlatformError) -> Self {
        Status::Overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_status_follows_error_kind() {
        let ok: Result<(), DownloadError> = Ok(());
        assert_eq!(<Status as From<&Result<(), DownloadError>>>::from(&ok), Status::Ok);

        let idle: Result<(), DownloadError> = Err(DownloadError::InvalidState(DownloadState::Idle));
        assert_eq!(<Status as From<&Result<(), DownloadError>>>::from(&idle), Status::InvalidState);

        let bad_sig: Result<(), DownloadError> = Err(IntegrityError::BadSignature.into());
        assert_eq!(<Status as From<&Result<(), DownloadError>>>::from(&bad_sig), Status::IntegrityFailure);
    }

    #[test]
    fn certificate_range_maps_to_incorrect_range() {
        let err = CredentialError::CertificateOutOfRange(4001);
        assert_eq!(<Status as From<&CredentialError>>::from(&err), Status::IncorrectRange);
    }
}
