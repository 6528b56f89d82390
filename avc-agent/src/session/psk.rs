// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * session/psk.rs - Pre-shared DTLS keys.
 */

/// A pre-shared DTLS key.
#[derive(Clone, Eq, PartialEq)]
pub struct PskKey {
    /// Identity of this key (or None if no identity is known).
    identity: Option<Box<[u8]>>,
    /// Actual key data (the key bytes).
    data: Box<[u8]>,
}

impl PskKey {
    /// Creates a new key object with the given `identity` and the actual key bytes given in `data`.
    pub fn new<T: Into<Vec<u8>>, U: Into<Vec<u8>>>(identity: Option<T>, data: U) -> PskKey {
        PskKey {
            identity: identity.map(Into::into).map(|v| v.into_boxed_slice()),
            data: data.into().into_boxed_slice(),
        }
    }

    /// Returns the key's identity or `None` if no key identity was set.
    pub fn identity(&self) -> Option<&[u8]> {
        self.identity.as_ref().map(|v| v.as_ref())
    }

    /// Returns the key data bytes as an immutable slice.
    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}

// Key bytes must never end up in logs.
impl std::fmt::Debug for PskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskKey")
            .field("identity", &self.identity.as_ref().map(|i| String::from_utf8_lossy(i)))
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .finish()
    }
}
