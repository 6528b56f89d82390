// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * integrity/signature.rs - RSASSA-PSS verification over SHA-1 digests.
 */

use ::sha1::{Digest, Sha1};
use rsa::{pkcs8::DecodePublicKey, traits::PublicKeyParts, BigUint, RsaPublicKey};
use tracing::debug;

use super::sha1::DIGEST_LEN;
use crate::error::IntegrityError;

/// DER encoding of the `rsaEncryption` AlgorithmIdentifier with NULL parameters.
const RSA_ALGORITHM_IDENTIFIER: [u8; 15] = [
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

/// Parses a provisioned RSA public key.
///
/// The key is expected to be a PKCS#1 `RSAPublicKey`, which is wrapped into a
/// SubjectPublicKeyInfo before parsing. Keys that are already SubjectPublicKeyInfo structures
/// are accepted as well.
pub fn parse_public_key(raw: &[u8]) -> Result<RsaPublicKey, IntegrityError> {
    RsaPublicKey::from_public_key_der(&wrap_spki(raw))
        .or_else(|_e| RsaPublicKey::from_public_key_der(raw))
        .map_err(|e| {
            debug!(error = %e, len = raw.len(), "unable to parse RSA public key");
            IntegrityError::KeyParse
        })
}

/// Wraps a PKCS#1 RSA public key into a SubjectPublicKeyInfo.
fn wrap_spki(pkcs1: &[u8]) -> Vec<u8> {
    let mut bit_string = vec![0x03];
    bit_string.extend(der_length(pkcs1.len() + 1));
    bit_string.push(0x00);

    let content_len = RSA_ALGORITHM_IDENTIFIER.len() + bit_string.len() + pkcs1.len();
    let mut spki = vec![0x30];
    spki.extend(der_length(content_len));
    spki.extend_from_slice(&RSA_ALGORITHM_IDENTIFIER);
    spki.extend(bit_string);
    spki.extend_from_slice(pkcs1);
    spki
}

/// Minimal DER length encoding.
fn der_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let mut out = vec![0x80 | (bytes.len() - skip) as u8];
    out.extend_from_slice(&bytes[skip..]);
    out
}

/// Verifies an RSASSA-PSS signature over a SHA-1 message digest.
///
/// SHA-1 is used as content hash and for MGF1. The salt length is recovered from the encoded
/// message, any length is accepted.
pub fn verify_pss_sha1(key: &RsaPublicKey, digest: &[u8; DIGEST_LEN], signature: &[u8]) -> Result<(), IntegrityError> {
    if signature.len() != key.size() {
        debug!(len = signature.len(), expected = key.size(), "signature length mismatch");
        return Err(IntegrityError::BadSignature);
    }
    let s = BigUint::from_bytes_be(signature);
    if &s >= key.n() {
        return Err(IntegrityError::BadSignature);
    }
    let m = s.modpow(key.e(), key.n());

    let em_bits = key.n().bits() - 1;
    let em_len = (em_bits + 7) / 8;
    let m = m.to_bytes_be();
    if m.len() > em_len {
        return Err(IntegrityError::BadSignature);
    }
    let mut em = vec![0u8; em_len];
    em[em_len - m.len()..].copy_from_slice(&m);

    if emsa_pss_verify(digest, &em, em_bits) {
        Ok(())
    } else {
        Err(IntegrityError::BadSignature)
    }
}

/// EMSA-PSS-VERIFY of RFC 8017 with SHA-1 and automatic salt length.
fn emsa_pss_verify(m_hash: &[u8; DIGEST_LEN], em: &[u8], em_bits: usize) -> bool {
    let em_len = em.len();
    if em_len < DIGEST_LEN + 2 || em[em_len - 1] != 0xbc {
        return false;
    }
    let (masked_db, rest) = em.split_at(em_len - DIGEST_LEN - 1);
    let h = &rest[..DIGEST_LEN];

    let unused_bits = 8 * em_len - em_bits;
    let top_mask = 0xffu8.checked_shr(unused_bits as u32).unwrap_or(0);
    if masked_db[0] & !top_mask != 0 {
        return false;
    }

    let mut db = mgf1_sha1(h, masked_db.len());
    db.iter_mut().zip(masked_db).for_each(|(d, m)| *d ^= m);
    db[0] &= top_mask;

    let Some(separator) = db.iter().position(|b| *b != 0) else {
        return false;
    };
    if db[separator] != 0x01 {
        return false;
    }
    let salt = &db[separator + 1..];

    let m_prime = Sha1::new()
        .chain_update([0u8; 8])
        .chain_update(m_hash)
        .chain_update(salt)
        .finalize();
    m_prime[..] == *h
}

fn mgf1_sha1(seed: &[u8], len: usize) -> Vec<u8> {
    let mut mask = Vec::with_capacity(len + DIGEST_LEN);
    let mut counter = 0u32;
    while mask.len() < len {
        let block = Sha1::new().chain_update(seed).chain_update(counter.to_be_bytes()).finalize();
        mask.extend_from_slice(&block);
        counter += 1;
    }
    mask.truncate(len);
    mask
}
