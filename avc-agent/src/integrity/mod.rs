// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * integrity/mod.rs - Package integrity verification.
 */

//! Package integrity verification.
//!
//! Packages are digested block-wise while they are downloaded. At the end of the package, the
//! server-provided signature is checked against the digest using the public key provisioned for
//! the package type.

use tracing::{debug, info, warn};

pub use sha1::{Sha1State, DIGEST_LEN, SERIALIZED_LEN};
pub use signature::{parse_public_key, verify_pss_sha1};

use crate::{
    credentials::{CredentialId, CredentialStore},
    error::{DigestError, IntegrityError},
};

pub mod sha1;
mod signature;

/// Type of an update package.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PackageType {
    /// Firmware package (LwM2M object 5).
    Fw,
    /// Software package (LwM2M object 9).
    Sw,
}

impl PackageType {
    /// Credential holding the verification key for this package type.
    pub fn key_id(&self) -> CredentialId {
        match self {
            PackageType::Fw => CredentialId::FwKey,
            PackageType::Sw => CredentialId::SwKey,
        }
    }

    /// Directory name used for persisted files of this package type.
    pub fn dir_name(&self) -> &'static str {
        match self {
            PackageType::Fw => "fw",
            PackageType::Sw => "sw",
        }
    }
}

/// The single digest context of the agent.
#[derive(Debug, Default)]
pub struct PackageVerifier {
    context: Option<Sha1State>,
}

impl PackageVerifier {
    pub fn new() -> PackageVerifier {
        PackageVerifier::default()
    }

    pub fn is_active(&self) -> bool {
        self.context.is_some()
    }

    /// Starts a new digest context.
    ///
    /// # Errors
    /// Returns [DigestError::AlreadyActive] if a context is running, cancel it first.
    pub fn start(&mut self) -> Result<(), DigestError> {
        if self.context.is_some() {
            return Err(DigestError::AlreadyActive);
        }
        self.context = Some(Sha1State::new());
        debug!("digest context started");
        Ok(())
    }

    /// Feeds package bytes into the digest.
    pub fn process(&mut self, data: &[u8]) -> Result<(), DigestError> {
        self.context.as_mut().ok_or(DigestError::NoContext)?.update(data);
        Ok(())
    }

    /// Finalizes the digest and verifies `signature` with the key provisioned for
    /// `package_type`.
    ///
    /// The context is consumed whatever the outcome.
    pub fn end(
        &mut self,
        credentials: &CredentialStore,
        package_type: PackageType,
        signature: &[u8],
    ) -> Result<(), IntegrityError> {
        let context = self.context.take().ok_or(DigestError::NoContext)?;
        let total_len = context.total_len();
        let digest = context.finalize();

        let raw_key = credentials.get(package_type.key_id())?;
        if raw_key.is_empty() {
            warn!(?package_type, "no package verification key provisioned");
            return Err(IntegrityError::KeyMissing(package_type));
        }
        let key = parse_public_key(&raw_key)?;
        match verify_pss_sha1(&key, &digest, signature) {
            Ok(()) => {
                info!(?package_type, total_len, "package signature verified");
                Ok(())
            },
            Err(e) => {
                warn!(?package_type, total_len, "package signature verification failed");
                Err(e)
            },
        }
    }

    /// Discards the running digest context, if any.
    pub fn cancel(&mut self) {
        if self.context.take().is_some() {
            debug!("digest context cancelled");
        }
    }

    /// Serializes the running digest context.
    pub fn copy_out(&self) -> Result<[u8; SERIALIZED_LEN], DigestError> {
        Ok(self.context.as_ref().ok_or(DigestError::NoContext)?.serialize())
    }

    /// Serializes the running digest context into `buf`, returning the number of bytes written.
    pub fn copy_out_into(&self, buf: &mut [u8]) -> Result<usize, DigestError> {
        let state = self.copy_out()?;
        let available = buf.len();
        let out = buf.get_mut(..SERIALIZED_LEN).ok_or(DigestError::Overflow {
            needed: SERIALIZED_LEN,
            available,
        })?;
        out.copy_from_slice(&state);
        Ok(SERIALIZED_LEN)
    }

    /// Replaces the digest context with a serialized one.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), DigestError> {
        let state = Sha1State::deserialize(bytes)?;
        debug!(total_len = state.total_len(), "digest context restored");
        self.context = Some(state);
        Ok(())
    }
}
