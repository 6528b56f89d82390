// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * platform.rs - Device information helpers.
 */

//! Helpers for device information reported to the server.

use std::fmt::Write;

use tracing::debug;

use crate::error::{IntegrityError, PlatformError};

/// Capacity of the firmware version resource.
pub const FW_VERSION_CAPACITY: usize = 255;
/// Command line key carrying the bootloader version.
pub const BOOTLOADER_VERSION_KEY: &str = "lkversion";

const UNKNOWN_VERSION: &str = "unknown";

/// Composes the firmware version string from `(component, version)` pairs.
///
/// Components are written as `component=version` and separated by commas, an empty version is
/// reported as `unknown`.
///
/// # Errors
/// Returns [PlatformError::Overflow] if the result is longer than `capacity` bytes. The result is
/// never truncated.
pub fn compose_firmware_version(components: &[(&str, &str)], capacity: usize) -> Result<String, PlatformError> {
    let mut out = String::new();
    for (index, (component, version)) in components.iter().enumerate() {
        let version = if version.is_empty() { UNKNOWN_VERSION } else { version };
        if index > 0 {
            out.push(',');
        }
        out.push_str(component);
        out.push('=');
        out.push_str(version);
    }
    if out.len() > capacity {
        return Err(PlatformError::Overflow {
            needed: out.len(),
            capacity,
        });
    }
    Ok(out)
}

/// Formats `data` as hex and ASCII, 16 bytes per line.
pub fn hex_dump(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(line, chunk)| {
            let mut text = format!("{:04x}:", line * 16);
            for byte in chunk {
                // Writing into a String cannot fail.
                let _ = write!(text, " {byte:02x}");
            }
            text.push_str(&"   ".repeat(16 - chunk.len()));
            text.push_str("  |");
            text.extend(chunk.iter().map(|b| {
                if b.is_ascii_graphic() || *b == b' ' {
                    char::from(*b)
                } else {
                    '.'
                }
            }));
            text.push('|');
            text
        })
        .collect()
}

/// Logs `data` as a hex dump at debug level.
pub fn log_hex_dump(label: &str, data: &[u8]) {
    for line in hex_dump(data) {
        debug!(target: "avc_agent::dump", "{label}: {line}");
    }
}

/// Returns the value of `key` on a kernel command line.
///
/// # Errors
/// Returns [IntegrityError::CmdlineToken] if no `key=value` token with a non-empty value exists.
pub fn cmdline_value<'a>(cmdline: &'a str, key: &str) -> Result<&'a str, IntegrityError> {
    cmdline
        .split_ascii_whitespace()
        .filter_map(|token| token.split_once('='))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| IntegrityError::CmdlineToken(key.to_string()))
}

/// Returns the bootloader version from a kernel command line.
pub fn bootloader_version(cmdline: &str) -> Result<&str, IntegrityError> {
    cmdline_value(cmdline, BOOTLOADER_VERSION_KEY)
}
