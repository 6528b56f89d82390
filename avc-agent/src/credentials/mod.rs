// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * credentials/mod.rs - Credential store.
 */

//! Persistent credential store.
//!
//! Credentials are opaque byte strings stored under `/avms/<name>` in a [SecureStorage]. An
//! absent credential is not an error: reads return an empty value and callers treat zero length
//! as "not present".

use std::{fmt::Display, rc::Rc};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tracing::{debug, info, warn};

pub use storage::{FileSecureStorage, MemoryStorage, SecureStorage};

use crate::error::CredentialError;

pub mod pem;
mod storage;

/// Maximum length of the device certificate.
pub const CERTIFICATE_MAX_LEN: usize = 4000;
/// Maximum length of every other credential.
pub const CREDENTIAL_MAX_LEN: usize = 2048;
/// Storage path of the SSL trust anchor in PEM form.
pub const SSL_CERTIFICATE_PATH: &str = "/avms/ssl/certificate.pem";

/// Identifiers of the stored credentials.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum CredentialId {
    /// Public key verifying firmware packages.
    FwKey = 0,
    /// Public key verifying software packages.
    SwKey = 1,
    /// Device certificate.
    Certificate = 2,
    BsPublicKey = 3,
    BsServerPublicKey = 4,
    BsSecretKey = 5,
    BsAddress = 6,
    DmPublicKey = 7,
    DmServerPublicKey = 8,
    DmSecretKey = 9,
    DmAddress = 10,
}

impl CredentialId {
    pub const ALL: [CredentialId; 11] = [
        CredentialId::FwKey,
        CredentialId::SwKey,
        CredentialId::Certificate,
        CredentialId::BsPublicKey,
        CredentialId::BsServerPublicKey,
        CredentialId::BsSecretKey,
        CredentialId::BsAddress,
        CredentialId::DmPublicKey,
        CredentialId::DmServerPublicKey,
        CredentialId::DmSecretKey,
        CredentialId::DmAddress,
    ];

    /// Name of the credential in the secure store.
    pub fn name(&self) -> &'static str {
        match self {
            CredentialId::FwKey => "FW_KEY",
            CredentialId::SwKey => "SW_KEY",
            CredentialId::Certificate => "CERTIFICATE",
            CredentialId::BsPublicKey => "BS_PUBLIC_KEY",
            CredentialId::BsServerPublicKey => "BS_SERVER_PUBLIC_KEY",
            CredentialId::BsSecretKey => "BS_SECRET_KEY",
            CredentialId::BsAddress => "BS_ADDRESS",
            CredentialId::DmPublicKey => "DM_PUBLIC_KEY",
            CredentialId::DmServerPublicKey => "DM_SERVER_PUBLIC_KEY",
            CredentialId::DmSecretKey => "DM_SECRET_KEY",
            CredentialId::DmAddress => "DM_ADDRESS",
        }
    }

    /// Storage path of the credential.
    pub fn path(&self) -> String {
        format!("/avms/{}", self.name())
    }

    /// Maximum payload length of the credential.
    pub fn max_len(&self) -> usize {
        match self {
            CredentialId::Certificate => CERTIFICATE_MAX_LEN,
            _ => CREDENTIAL_MAX_LEN,
        }
    }
}

impl Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u32> for CredentialId {
    type Error = CredentialError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        <CredentialId as FromPrimitive>::from_u32(value).ok_or(CredentialError::UnknownId(value))
    }
}

/// Credential store over a [SecureStorage].
#[derive(Clone)]
pub struct CredentialStore {
    storage: Rc<dyn SecureStorage>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(storage: Rc<dyn SecureStorage>) -> CredentialStore {
        CredentialStore { storage }
    }

    /// Reads a credential. Returns an empty value if it is not provisioned.
    pub fn get(&self, id: CredentialId) -> Result<Vec<u8>, CredentialError> {
        let data = self
            .storage
            .read(&id.path())
            .map_err(|source| CredentialError::Storage { id, source })?;
        Ok(data.unwrap_or_default())
    }

    /// Reads a credential into `buf`, returning its length (zero if not provisioned).
    ///
    /// # Errors
    /// Returns [CredentialError::Overflow] if `buf` is too small for the stored value.
    pub fn get_into(&self, id: CredentialId, buf: &mut [u8]) -> Result<usize, CredentialError> {
        let data = self.get(id)?;
        let available = buf.len();
        let out = buf.get_mut(..data.len()).ok_or(CredentialError::Overflow {
            needed: data.len(),
            available,
        })?;
        out.copy_from_slice(&data);
        Ok(data.len())
    }

    /// Creates or overwrites a credential.
    pub fn set(&self, id: CredentialId, data: &[u8]) -> Result<(), CredentialError> {
        if data.len() > id.max_len() {
            return Err(CredentialError::TooLarge {
                id,
                len: data.len(),
                max: id.max_len(),
            });
        }
        self.storage.write(&id.path(), data).map_err(|source| {
            warn!(%id, error = %source, "unable to store credential");
            CredentialError::Storage { id, source }
        })?;
        debug!(%id, len = data.len(), "credential stored");
        Ok(())
    }

    /// Returns whether a non-empty credential is provisioned.
    pub fn check(&self, id: CredentialId) -> Result<bool, CredentialError> {
        let mut scratch = [0u8; 1];
        match self.get_into(id, &mut scratch) {
            Ok(len) => Ok(len > 0),
            Err(CredentialError::Overflow { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Removes a credential. Removing an absent credential succeeds.
    pub fn delete(&self, id: CredentialId) -> Result<(), CredentialError> {
        self.storage.delete(&id.path()).map_err(|source| {
            warn!(%id, error = %source, "unable to delete credential");
            CredentialError::Storage { id, source }
        })?;
        debug!(%id, "credential deleted");
        Ok(())
    }

    /// Replaces the SSL trust anchor used for package downloads.
    ///
    /// `base64` is the certificate as single-line Base64. An empty value deletes the stored
    /// certificate.
    ///
    /// # Errors
    /// Returns [CredentialError::CertificateOutOfRange] if `base64` is longer than
    /// [CERTIFICATE_MAX_LEN].
    pub fn update_ssl_certificate(&self, base64: &[u8]) -> Result<(), CredentialError> {
        let storage_error = |source| CredentialError::Storage {
            id: CredentialId::Certificate,
            source,
        };
        if base64.is_empty() {
            self.storage.delete(SSL_CERTIFICATE_PATH).map_err(storage_error)?;
            info!("SSL certificate removed");
            return Ok(());
        }
        if base64.len() > CERTIFICATE_MAX_LEN {
            return Err(CredentialError::CertificateOutOfRange(base64.len()));
        }
        let mut document = vec![0u8; pem::layout_len(base64.len())];
        let len = pem::lay_out(base64, &mut document)?;
        document.truncate(len);
        self.storage
            .write(SSL_CERTIFICATE_PATH, &document)
            .map_err(storage_error)?;
        info!(len, "SSL certificate updated");
        Ok(())
    }

    /// Reads the SSL trust anchor in PEM form, empty if none is stored.
    pub fn ssl_certificate(&self) -> Result<Vec<u8>, CredentialError> {
        let data = self
            .storage
            .read(SSL_CERTIFICATE_PATH)
            .map_err(|source| CredentialError::Storage {
                id: CredentialId::Certificate,
                source,
            })?;
        Ok(data.unwrap_or_default())
    }
}
