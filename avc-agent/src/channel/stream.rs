// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * channel/stream.rs - Bounded stream buffer for block-wise transfers.
 */

use super::StreamStatus;

/// Buffer accumulating or emitting a block-wise CoAP stream.
///
/// Invariant: `offset <= len() <= capacity()`.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    data: Vec<u8>,
    capacity: usize,
    offset: usize,
    end_flag: bool,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> StreamBuffer {
        StreamBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
            offset: 0,
            end_flag: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns whether the last stream written into the buffer has ended.
    pub fn is_ended(&self) -> bool {
        self.end_flag
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.offset = 0;
        self.end_flag = false;
    }

    /// Appends `payload` if the buffer stays strictly below its capacity. Returns whether the
    /// payload was appended.
    pub fn append(&mut self, payload: &[u8]) -> bool {
        if self.data.len() + payload.len() >= self.capacity {
            return false;
        }
        self.data.extend_from_slice(payload);
        true
    }

    pub fn set_ended(&mut self) {
        self.end_flag = true;
    }

    /// Replaces the content with `data` for sending. Returns `false` if it does not fit.
    pub fn load(&mut self, data: &[u8]) -> bool {
        if data.len() > self.capacity {
            return false;
        }
        self.reset();
        self.data.extend_from_slice(data);
        self.end_flag = true;
        true
    }

    /// Takes the next chunk of at most `max_payload` bytes for sending.
    ///
    /// The first chunk of a stream that fits into one message is sent as
    /// [StreamStatus::None]. Longer streams start with [StreamStatus::TxStart], continue with
    /// [StreamStatus::TxInProgress] and end with [StreamStatus::TxEnd]. The offset is reset once
    /// the whole content was taken.
    pub fn next_chunk(&mut self, max_payload: usize) -> (Vec<u8>, StreamStatus) {
        let start = self.offset;
        let end = (start + max_payload).min(self.data.len());
        let status = match (start == 0, end == self.data.len()) {
            (true, true) => StreamStatus::None,
            (true, false) => StreamStatus::TxStart,
            (false, false) => StreamStatus::TxInProgress,
            (false, true) => StreamStatus::TxEnd,
        };
        let chunk = self.data[start..end].to_vec();
        self.offset = if end == self.data.len() { 0 } else { end };
        (chunk, status)
    }

    /// Restarts the transmission at the first chunk, keeping the content.
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// Returns whether a chunked transmission is in progress.
    pub fn is_sending(&self) -> bool {
        self.offset > 0
    }
}
