// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * integrity/sha1.rs - Checkpointable SHA-1.
 */

//! SHA-1 with a serializable intermediate state.
//!
//! Package downloads may be interrupted and resumed after a reboot, so the running digest has to
//! be persisted next to the download offset. [Sha1State::serialize] produces a fixed-length,
//! versioned representation of the complete state. Blocks are compressed by the RustCrypto
//! [sha1](::sha1) crate, which does not expose its chaining value, so the block buffer and the
//! final padding are kept here.
//!
//! Serialized layout (all lengths in bytes):
//!
//! | offset | len | content                          |
//! |--------|-----|----------------------------------|
//! | 0      | 1   | format version (`1`)             |
//! | 1      | 20  | chaining value, big endian words |
//! | 21     | 8   | total input length, little endian|
//! | 29     | 1   | number of buffered bytes         |
//! | 30     | 64  | block buffer, zero padded        |

use ::sha1::{Digest, Sha1};

use crate::error::DigestError;

/// Length of a SHA-1 digest.
pub const DIGEST_LEN: usize = 20;
/// Length of a serialized [Sha1State].
pub const SERIALIZED_LEN: usize = 1 + 20 + 8 + 1 + BLOCK_LEN;

const BLOCK_LEN: usize = 64;
const FORMAT_VERSION: u8 = 1;
const INITIAL_STATE: [u32; 5] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476, 0xc3d2e1f0];

/// Running SHA-1 computation.
#[derive(Clone, Eq, PartialEq)]
pub struct Sha1State {
    h: [u32; 5],
    total_len: u64,
    buffer: [u8; BLOCK_LEN],
    buffered: usize,
}

impl std::fmt::Debug for Sha1State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha1State")
            .field("total_len", &self.total_len)
            .field("buffered", &self.buffered)
            .finish_non_exhaustive()
    }
}

impl Default for Sha1State {
    fn default() -> Self {
        Self::new()
    }
}

impl Sha1State {
    pub fn new() -> Sha1State {
        Sha1State {
            h: INITIAL_STATE,
            total_len: 0,
            buffer: [0; BLOCK_LEN],
            buffered: 0,
        }
    }

    /// Total number of bytes fed into the digest so far.
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total_len = self.total_len.wrapping_add(data.len() as u64);
        if self.buffered > 0 {
            let take = (BLOCK_LEN - self.buffered).min(data.len());
            self.buffer[self.buffered..self.buffered + take].copy_from_slice(&data[..take]);
            self.buffered += take;
            data = &data[take..];
            if self.buffered < BLOCK_LEN {
                return;
            }
            ::sha1::compress(&mut self.h, &[self.buffer.into()]);
            self.buffered = 0;
        }
        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for chunk in &mut blocks {
            let mut block = [0u8; BLOCK_LEN];
            block.copy_from_slice(chunk);
            ::sha1::compress(&mut self.h, &[block.into()]);
        }
        let rest = blocks.remainder();
        self.buffer[..rest.len()].copy_from_slice(rest);
        self.buffered = rest.len();
    }

    /// Pads the message and returns the digest, consuming the state.
    pub fn finalize(mut self) -> [u8; DIGEST_LEN] {
        let bit_len = self.total_len.wrapping_mul(8);
        let mut padding = [0u8; 2 * BLOCK_LEN];
        padding[0] = 0x80;
        // Pad so that 8 bytes remain for the length in the last block.
        let pad_len = if self.buffered < 56 {
            56 - self.buffered
        } else {
            120 - self.buffered
        };
        padding[pad_len..pad_len + 8].copy_from_slice(&bit_len.to_be_bytes());
        let total = self.total_len;
        self.update(&padding[..pad_len + 8]);
        debug_assert_eq!(self.buffered, 0);
        self.total_len = total;

        let mut digest = [0u8; DIGEST_LEN];
        for (chunk, word) in digest.chunks_exact_mut(4).zip(self.h.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        digest
    }

    /// Serializes the complete state, see the module documentation for the layout.
    pub fn serialize(&self) -> [u8; SERIALIZED_LEN] {
        let mut out = [0u8; SERIALIZED_LEN];
        out[0] = FORMAT_VERSION;
        for (chunk, word) in out[1..21].chunks_exact_mut(4).zip(self.h.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out[21..29].copy_from_slice(&self.total_len.to_le_bytes());
        out[29] = self.buffered as u8;
        out[30..30 + self.buffered].copy_from_slice(&self.buffer[..self.buffered]);
        out
    }

    /// Restores a state produced by [Sha1State::serialize].
    ///
    /// # Errors
    /// Returns [DigestError::InvalidCheckpoint] if the length, version or buffer fill level do not
    /// match, or if the buffered byte count disagrees with the total length.
    pub fn deserialize(bytes: &[u8]) -> Result<Sha1State, DigestError> {
        if bytes.len() != SERIALIZED_LEN || bytes[0] != FORMAT_VERSION {
            return Err(DigestError::InvalidCheckpoint);
        }
        let mut h = [0u32; 5];
        for (word, chunk) in h.iter_mut().zip(bytes[1..21].chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[21..29]);
        let total_len = u64::from_le_bytes(len_bytes);
        let buffered = usize::from(bytes[29]);
        if buffered >= BLOCK_LEN || total_len % BLOCK_LEN as u64 != buffered as u64 {
            return Err(DigestError::InvalidCheckpoint);
        }
        let mut buffer = [0u8; BLOCK_LEN];
        buffer[..buffered].copy_from_slice(&bytes[30..30 + buffered]);
        Ok(Sha1State {
            h,
            total_len,
            buffer,
            buffered,
        })
    }
}

/// Computes the SHA-1 digest of `data`.
pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn known_vectors() {
        let hash = |data: &[u8]| {
            let mut state = Sha1State::new();
            state.update(data);
            hex(&state.finalize())
        };
        assert_eq!(hash(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(hash(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            hash(b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq"),
            "84983e441c3bd26ebaae4aa1f95129e5e54670f1"
        );
    }

    #[test]
    fn padding_matches_one_shot_digest() {
        for len in [0usize, 1, 55, 56, 63, 64, 65, 119, 120, 1000] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let mut state = Sha1State::new();
            for chunk in data.chunks(13) {
                state.update(chunk);
            }
            assert_eq!(state.finalize(), digest(&data), "length {len}");
        }
    }

    #[test]
    fn checkpoint_restores_identical_state() {
        let mut state = Sha1State::new();
        state.update(&[0x5a; 100]);
        let restored = Sha1State::deserialize(&state.serialize()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn corrupted_checkpoint_rejected() {
        let mut state = Sha1State::new();
        state.update(&[1, 2, 3]);
        let mut bytes = state.serialize();
        bytes[29] = 4;
        assert_eq!(Sha1State::deserialize(&bytes), Err(DigestError::InvalidCheckpoint));
        assert_eq!(
            Sha1State::deserialize(&bytes[..SERIALIZED_LEN - 1]),
            Err(DigestError::InvalidCheckpoint)
        );
        bytes[29] = 3;
        bytes[0] = 2;
        assert_eq!(Sha1State::deserialize(&bytes), Err(DigestError::InvalidCheckpoint));
    }
}
