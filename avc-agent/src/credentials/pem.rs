// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * credentials/pem.rs - PEM lay-out of single-line Base64 certificates.
 */

use crate::error::PemError;

pub const PEM_HEADER: &str = "-----BEGIN CERTIFICATE-----\n";
pub const PEM_FOOTER: &str = "-----END CERTIFICATE-----\n";
/// Number of Base64 characters per PEM body line.
pub const LINE_LEN: usize = 64;

/// Returns the exact length of the PEM document for `input_len` Base64 characters.
pub fn layout_len(input_len: usize) -> usize {
    PEM_HEADER.len() + input_len + (input_len + LINE_LEN - 1) / LINE_LEN + PEM_FOOTER.len()
}

/// Lays out single-line Base64 `input` as a PEM certificate into `out`.
///
/// Every body line, including the last partial one, is terminated by a newline. Returns the
/// number of bytes written.
///
/// # Errors
/// Returns [PemError::BufferTooSmall] if `out` is shorter than [layout_len].
pub fn lay_out(input: &[u8], out: &mut [u8]) -> Result<usize, PemError> {
    let needed = layout_len(input.len());
    if out.len() < needed {
        return Err(PemError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }
    let mut pos = 0;
    let mut put = |bytes: &[u8]| {
        out[pos..pos + bytes.len()].copy_from_slice(bytes);
        pos += bytes.len();
    };
    put(PEM_HEADER.as_bytes());
    for line in input.chunks(LINE_LEN) {
        put(line);
        put(b"\n");
    }
    put(PEM_FOOTER.as_bytes());
    debug_assert_eq!(pos, needed);
    Ok(pos)
}

/// Lays out `input` into a newly allocated buffer of the exact size.
pub fn lay_out_vec(input: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; layout_len(input.len())];
    // The buffer has exactly the required length.
    let len = lay_out(input, &mut out).unwrap_or(0);
    out.truncate(len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_full_line() {
        let input = "AAAA".repeat(16);
        let pem = lay_out_vec(input.as_bytes());
        let body = &pem[PEM_HEADER.len()..pem.len() - PEM_FOOTER.len()];
        assert_eq!(body.len(), 65);
        assert_eq!(body.iter().position(|b| *b == b'\n'), Some(64));
        assert_eq!(body.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn partial_last_line_is_terminated() {
        let input = "B".repeat(130);
        let pem = String::from_utf8(lay_out_vec(input.as_bytes())).unwrap();
        let lines: Vec<&str> = pem.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1].len(), 64);
        assert_eq!(lines[2].len(), 64);
        assert_eq!(lines[3].len(), 2);
        assert!(pem.starts_with(PEM_HEADER));
        assert!(pem.ends_with(PEM_FOOTER));
        assert_eq!(pem.len(), layout_len(130));
    }

    #[test]
    fn exact_length_is_enough() {
        let input = [b'C'; 100];
        let mut out = vec![0u8; layout_len(100)];
        assert_eq!(lay_out(&input, &mut out), Ok(out.len()));
        let mut short = vec![0u8; layout_len(100) - 1];
        assert_eq!(
            lay_out(&input, &mut short),
            Err(PemError::BufferTooSmall {
                needed: layout_len(100),
                available: layout_len(100) - 1
            })
        );
    }

    #[test]
    fn empty_input() {
        assert_eq!(lay_out_vec(b""), format!("{PEM_HEADER}{PEM_FOOTER}").into_bytes());
    }
}
