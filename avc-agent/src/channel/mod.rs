// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * channel/mod.rs - CoAP application data channel.
 */

//! CoAP application data channel.
//!
//! The channel carries application payloads between the server and the device on top of the
//! LwM2M session. Inbound `PUT`/`POST` streams are accumulated in a receive buffer, `GET`
//! requests are answered block-wise from a transmit buffer, and device-originated data is pushed
//! with an acknowledgement callback.

use tracing::{debug, info, warn};

pub use stream::StreamBuffer;

use crate::error::ChannelError;

mod stream;

/// CoAP content format for CBOR.
pub const CONTENT_TYPE_CBOR: u16 = 60;

/// Code of a request handled by the channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RequestCode {
    Get,
    Put,
    Post,
    Delete,
    /// 2.31 Continue, asking for the next block of a response.
    Continue,
}

/// Response codes emitted by the channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResponseCode {
    /// 2.04
    Changed,
    /// 2.05
    Content,
    /// 4.05
    MethodNotAllowed,
}

impl ResponseCode {
    /// Returns the code as a single byte, class in the upper three bits.
    pub fn to_u8(&self) -> u8 {
        let (class, detail) = match self {
            ResponseCode::Changed => (2, 4),
            ResponseCode::Content => (2, 5),
            ResponseCode::MethodNotAllowed => (4, 5),
        };
        (class << 5) | detail
    }
}

/// Position of a message within a block-wise stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StreamStatus {
    /// Not part of a stream, the payload is complete.
    None,
    RxStart,
    RxInProgress,
    RxEnd,
    TxStart,
    TxInProgress,
    TxEnd,
}

/// A request delivered to the channel by the LwM2M core.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AppRequest {
    pub code: RequestCode,
    pub stream_status: StreamStatus,
    pub message_id: u16,
    pub content_type: u16,
    pub uri: String,
    pub token: Vec<u8>,
    pub payload: Vec<u8>,
}

/// A response produced by the channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AppResponse {
    pub code: ResponseCode,
    pub stream_status: StreamStatus,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub content_type: u16,
    pub payload: Vec<u8>,
}

/// A block of a device-originated push.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PushMessage {
    pub uri: String,
    pub token: Vec<u8>,
    pub content_type: u16,
    pub stream_status: StreamStatus,
    pub payload: Vec<u8>,
}

/// Outcome of a push, reported to the push callback.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PushAckStatus {
    Success,
    Failed,
    /// The server answered with this CoAP response code.
    Code(u8),
}

/// Callback receiving the outcome of a push, called exactly once.
pub type PushCallback = Box<dyn FnOnce(PushAckStatus)>;

/// Sends push blocks to the server, implemented by the LwM2M core.
pub trait PushSender {
    /// Sends a push block as a confirmable message, returning its message id.
    fn send_push(&mut self, message: &PushMessage) -> Result<u16, String>;
}

struct PendingPush {
    uri: String,
    token: Vec<u8>,
    content_type: u16,
    message_id: u16,
    callback: PushCallback,
}

/// The CoAP application data channel.
pub struct AppChannel {
    rx: StreamBuffer,
    tx: StreamBuffer,
    push_buf: StreamBuffer,
    max_payload: usize,
    pending_push: Option<PendingPush>,
}

impl std::fmt::Debug for AppChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppChannel")
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .field("max_payload", &self.max_payload)
            .field("push_in_progress", &self.pending_push.is_some())
            .finish()
    }
}

impl AppChannel {
    /// Creates a channel sending at most `max_payload` bytes per block, with stream buffers of
    /// `stream_max` bytes.
    pub fn new(max_payload: usize, stream_max: usize) -> AppChannel {
        AppChannel {
            rx: StreamBuffer::new(stream_max),
            tx: StreamBuffer::new(stream_max),
            push_buf: StreamBuffer::new(stream_max),
            max_payload,
            pending_push: None,
        }
    }

    /// Received application data.
    pub fn rx(&self) -> &StreamBuffer {
        &self.rx
    }

    /// Data served to `GET` requests.
    pub fn tx(&self) -> &StreamBuffer {
        &self.tx
    }

    /// Sets the data served to `GET` requests.
    pub fn set_tx_data(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.tx.load(data) {
            return Err(ChannelError::PayloadTooLarge {
                len: data.len(),
                max: self.tx.capacity(),
            });
        }
        Ok(())
    }

    pub fn is_push_in_progress(&self) -> bool {
        self.pending_push.is_some()
    }

    /// Handles a request, returning the response to send, if any.
    pub fn handle_request(&mut self, request: &AppRequest) -> Option<AppResponse> {
        match request.code {
            RequestCode::Put | RequestCode::Post => self.handle_inbound(request),
            RequestCode::Get | RequestCode::Continue => Some(self.handle_outbound(request)),
            RequestCode::Delete => {
                debug!(uri = %request.uri, "DELETE not supported on the application channel");
                Some(self.response(request, ResponseCode::MethodNotAllowed, StreamStatus::None, Vec::new()))
            },
        }
    }

    fn handle_inbound(&mut self, request: &AppRequest) -> Option<AppResponse> {
        let starts_stream = matches!(request.stream_status, StreamStatus::RxStart | StreamStatus::None);
        if starts_stream && self.rx.is_ended() {
            self.rx.reset();
        }
        if !self.rx.append(&request.payload) {
            warn!(
                len = request.payload.len(),
                buffered = self.rx.len(),
                max = self.rx.capacity(),
                "dropping inbound payload exceeding the stream buffer"
            );
        }
        match request.stream_status {
            StreamStatus::RxStart | StreamStatus::RxInProgress => None,
            _ => {
                self.rx.set_ended();
                debug!(len = self.rx.len(), "inbound stream complete");
                Some(self.response(request, ResponseCode::Changed, StreamStatus::None, Vec::new()))
            },
        }
    }

    fn handle_outbound(&mut self, request: &AppRequest) -> AppResponse {
        let continues = request.code == RequestCode::Continue
            || matches!(request.stream_status, StreamStatus::TxStart | StreamStatus::TxInProgress);
        if !continues && self.tx.is_sending() {
            debug!(offset = self.tx.offset(), "restarting abandoned block transfer");
            self.tx.rewind();
        }
        let (chunk, status) = self.tx.next_chunk(self.max_payload);
        self.response(request, ResponseCode::Content, status, chunk)
    }

    fn response(&self, request: &AppRequest, code: ResponseCode, stream_status: StreamStatus, payload: Vec<u8>) -> AppResponse {
        AppResponse {
            code,
            stream_status,
            message_id: request.message_id,
            token: request.token.clone(),
            content_type: CONTENT_TYPE_CBOR,
            payload,
        }
    }

    /// Pushes `data` to the server at `uri`.
    ///
    /// Data larger than one block is sent block-wise, each block after the previous one was
    /// acknowledged. The stream status of each block follows from the data length, see
    /// [StreamBuffer::next_chunk]: data of at most one block is sent as [StreamStatus::None],
    /// longer data as [StreamStatus::TxStart], then [StreamStatus::TxInProgress] blocks, then a
    /// final [StreamStatus::TxEnd] block. `callback` is called once, after the last block was
    /// acknowledged or as soon as a block failed.
    ///
    /// # Errors
    /// - [ChannelError::PushInProgress] if a push is waiting for its acknowledgement.
    /// - [ChannelError::EmptyPayload] if `data` is empty.
    /// - [ChannelError::PayloadTooLarge] if `data` exceeds the stream buffer.
    /// - [ChannelError::Send] if the first block could not be sent. The callback is not called.
    pub fn push(
        &mut self,
        sender: &mut dyn PushSender,
        uri: &str,
        token: &[u8],
        content_type: u16,
        data: &[u8],
        callback: PushCallback,
    ) -> Result<(), ChannelError> {
        if self.pending_push.is_some() {
            return Err(ChannelError::PushInProgress);
        }
        if data.is_empty() {
            return Err(ChannelError::EmptyPayload);
        }
        if !self.push_buf.load(data) {
            return Err(ChannelError::PayloadTooLarge {
                len: data.len(),
                max: self.push_buf.capacity(),
            });
        }
        let mut pending = PendingPush {
            uri: uri.to_string(),
            token: token.to_vec(),
            content_type,
            message_id: 0,
            callback,
        };
        pending.message_id = self.send_next_block(sender, &pending).map_err(|e| {
            self.push_buf.reset();
            e
        })?;
        info!(uri, len = data.len(), "push started");
        self.pending_push = Some(pending);
        Ok(())
    }

    fn send_next_block(&mut self, sender: &mut dyn PushSender, pending: &PendingPush) -> Result<u16, ChannelError> {
        let (payload, stream_status) = self.push_buf.next_chunk(self.max_payload);
        let message = PushMessage {
            uri: pending.uri.clone(),
            token: pending.token.clone(),
            content_type: pending.content_type,
            stream_status,
            payload,
        };
        sender.send_push(&message).map_err(ChannelError::Send)
    }

    /// Handles the acknowledgement of a push block.
    ///
    /// Acknowledgements for other message ids are ignored and `false` is returned.
    pub fn on_push_ack(&mut self, sender: &mut dyn PushSender, message_id: u16, status: PushAckStatus) -> bool {
        let Some(mut pending) = self.pending_push.take() else {
            return false;
        };
        if pending.message_id != message_id {
            self.pending_push = Some(pending);
            return false;
        }
        let outcome = match status {
            PushAckStatus::Success if self.push_buf.is_sending() => match self.send_next_block(sender, &pending) {
                Ok(next_id) => {
                    pending.message_id = next_id;
                    self.pending_push = Some(pending);
                    return true;
                },
                Err(e) => {
                    warn!(error = %e, "unable to send next push block");
                    PushAckStatus::Failed
                },
            },
            status => status,
        };
        self.push_buf.reset();
        debug!(?outcome, "push finished");
        (pending.callback)(outcome);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    #[derive(Default)]
    struct RecordingSender {
        sent: Vec<PushMessage>,
    }

    impl PushSender for RecordingSender {
        fn send_push(&mut self, message: &PushMessage) -> Result<u16, String> {
            self.sent.push(message.clone());
            Ok(self.sent.len() as u16)
        }
    }

    fn request(code: RequestCode, stream_status: StreamStatus, payload: &[u8]) -> AppRequest {
        AppRequest {
            code,
            stream_status,
            message_id: 7,
            content_type: CONTENT_TYPE_CBOR,
            uri: "/app".to_string(),
            token: vec![1, 2],
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn ended_stream_is_replaced_by_next_start() {
        let mut channel = AppChannel::new(16, 192);
        channel.handle_request(&request(RequestCode::Post, StreamStatus::None, b"old"));
        assert!(channel.rx().is_ended());
        assert!(channel
            .handle_request(&request(RequestCode::Post, StreamStatus::RxStart, b"new"))
            .is_none());
        assert_eq!(channel.rx().as_slice(), b"new");
        assert!(!channel.rx().is_ended());
    }

    #[test]
    fn oversized_payload_dropped() {
        let mut channel = AppChannel::new(16, 32);
        channel.handle_request(&request(RequestCode::Put, StreamStatus::RxStart, &[1; 20]));
        channel.handle_request(&request(RequestCode::Put, StreamStatus::RxInProgress, &[2; 20]));
        let response = channel.handle_request(&request(RequestCode::Put, StreamStatus::RxEnd, &[3; 4]));
        assert_eq!(channel.rx().len(), 24);
        assert_eq!(response.unwrap().code, ResponseCode::Changed);
    }

    #[test]
    fn get_served_block_wise() {
        let mut channel = AppChannel::new(16, 192);
        channel.set_tx_data(&[9; 40]).unwrap();
        let first = channel.handle_request(&request(RequestCode::Get, StreamStatus::None, b"")).unwrap();
        assert_eq!((first.payload.len(), first.stream_status), (16, StreamStatus::TxStart));
        let second = channel
            .handle_request(&request(RequestCode::Continue, StreamStatus::None, b""))
            .unwrap();
        assert_eq!(second.stream_status, StreamStatus::TxInProgress);
        let last = channel
            .handle_request(&request(RequestCode::Continue, StreamStatus::None, b""))
            .unwrap();
        assert_eq!((last.payload.len(), last.stream_status), (8, StreamStatus::TxEnd));
        assert_eq!(channel.tx().offset(), 0);
    }

    #[test]
    fn delete_not_allowed() {
        let mut channel = AppChannel::new(16, 192);
        let response = channel
            .handle_request(&request(RequestCode::Delete, StreamStatus::None, b""))
            .unwrap();
        assert_eq!(response.code.to_u8(), 0xa5);
    }

    #[test]
    fn push_acknowledged_after_last_block() {
        let mut channel = AppChannel::new(16, 192);
        let mut sender = RecordingSender::default();
        let outcome = Rc::new(RefCell::new(Vec::new()));
        let record = outcome.clone();
        channel
            .push(
                &mut sender,
                "/push",
                b"t",
                CONTENT_TYPE_CBOR,
                &[5; 20],
                Box::new(move |status| record.borrow_mut().push(status)),
            )
            .unwrap();
        assert_eq!(
            channel.push(&mut sender, "/push", b"t", CONTENT_TYPE_CBOR, b"x", Box::new(|_| {})),
            Err(ChannelError::PushInProgress)
        );

        assert!(!channel.on_push_ack(&mut sender, 99, PushAckStatus::Success));
        assert!(channel.on_push_ack(&mut sender, 1, PushAckStatus::Success));
        assert!(outcome.borrow().is_empty());
        assert_eq!(sender.sent[1].stream_status, StreamStatus::TxEnd);
        assert!(channel.on_push_ack(&mut sender, 2, PushAckStatus::Success));
        assert_eq!(*outcome.borrow(), vec![PushAckStatus::Success]);
        assert!(!channel.is_push_in_progress());
    }

    #[test]
    fn push_stream_status_follows_length() {
        let mut channel = AppChannel::new(16, 192);
        let mut sender = RecordingSender::default();
        channel
            .push(&mut sender, "/push", b"t", CONTENT_TYPE_CBOR, &[1; 16], Box::new(|_| {}))
            .unwrap();
        assert_eq!(sender.sent[0].stream_status, StreamStatus::None);
        assert!(channel.on_push_ack(&mut sender, 1, PushAckStatus::Success));

        channel
            .push(&mut sender, "/push", b"t", CONTENT_TYPE_CBOR, &[2; 40], Box::new(|_| {}))
            .unwrap();
        assert!(channel.on_push_ack(&mut sender, 2, PushAckStatus::Success));
        assert!(channel.on_push_ack(&mut sender, 3, PushAckStatus::Success));
        let statuses: Vec<_> = sender.sent[1..].iter().map(|m| m.stream_status).collect();
        assert_eq!(
            statuses,
            vec![StreamStatus::TxStart, StreamStatus::TxInProgress, StreamStatus::TxEnd]
        );
        assert!(channel.on_push_ack(&mut sender, 4, PushAckStatus::Success));
        assert!(!channel.is_push_in_progress());
    }

    #[test]
    fn push_failure_reported_once() {
        let mut channel = AppChannel::new(16, 192);
        let mut sender = RecordingSender::default();
        let outcome = Rc::new(RefCell::new(Vec::new()));
        let record = outcome.clone();
        channel
            .push(
                &mut sender,
                "/push",
                b"t",
                CONTENT_TYPE_CBOR,
                &[5; 40],
                Box::new(move |status| record.borrow_mut().push(status)),
            )
            .unwrap();
        assert!(channel.on_push_ack(&mut sender, 1, PushAckStatus::Code(0x80)));
        assert!(!channel.on_push_ack(&mut sender, 2, PushAckStatus::Success));
        assert_eq!(*outcome.borrow(), vec![PushAckStatus::Code(0x80)]);
    }
}
