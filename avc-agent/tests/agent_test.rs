// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * tests/agent_test.rs - Tests for the agent event loop.
 */

#![cfg(feature = "dtls-psk")]

use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, SystemTime},
};

use avc_agent::{
    channel::{PushAckStatus, CONTENT_TYPE_CBOR},
    session::{HandshakeState, ServerKind},
    config::AgentConfigBuilder,
    credentials::{CredentialId, CredentialStore, FileSecureStorage},
    time::{Clock, ManualClock},
    Agent, NoopEventHandler,
};

mod common;

use common::{
    CoreLog, EngineLog, FlakyResolver, Harness, IdleDownloader, ScriptedCore, ScriptedEngine, CLIENT_HELLO, FINISHED,
    SERVER_TIME,
};

#[test]
pub fn nat_timeout_triggers_single_rehandshake() {
    let mut harness = Harness::new(Duration::from_secs(5));
    harness.establish();
    assert_eq!(harness.engine.borrow().handshakes, vec![(false, false)]);
    assert_eq!(harness.events.borrow().established, vec![false]);
    assert_eq!(harness.core.borrow().established, 1);

    harness.idle(Duration::from_millis(4900));
    assert_eq!(harness.engine.borrow().rehandshakes(), 0);

    harness.idle(Duration::from_millis(200));
    assert_eq!(harness.engine.borrow().handshakes, vec![(false, false), (true, false)]);
    assert_eq!(harness.events.borrow().rehandshakes, vec![false]);
    assert_eq!(harness.server_recv(), CLIENT_HELLO);

    // The NAT timer stays stopped while the rehandshake runs.
    harness.idle(Duration::from_secs(25));
    assert_eq!(harness.engine.borrow().handshakes.len(), 2);
    assert_eq!(harness.agent.session().state(), HandshakeState::Rehandshaking);

    harness.server_send(FINISHED);
    harness.run_until(|agent| agent.session().state() == HandshakeState::Established);
    assert_eq!(harness.events.borrow().established, vec![false, true]);
}

#[test]
pub fn unanswered_rehandshake_retried_with_backoff() {
    let mut harness = Harness::new(Duration::from_secs(5));
    harness.establish();
    harness.idle(Duration::from_millis(5100));
    assert_eq!(harness.engine.borrow().handshakes.len(), 2);

    // The server stays silent for an hour.
    for _ in 0..60 {
        harness.idle(Duration::from_secs(60));
        if let Some(retry_at) = harness.agent.session().retry_at() {
            let wait = retry_at.saturating_sub(harness.clock.monotonic());
            assert!(wait <= Duration::from_secs(66), "back-off of {wait:?}");
        }
    }
    let attempts = harness.engine.borrow().handshakes.len();
    assert!(attempts > 10, "only {attempts} handshakes");
    assert!(harness.engine.borrow().handshakes[2..].iter().all(|h| *h == (false, false)));
    assert!(harness.events.borrow().failed >= attempts - 2);

    // Jitter may push the next attempt past a single idle period.
    for _ in 0..3 {
        if harness.agent.session().state().is_handshaking() {
            break;
        }
        harness.idle(Duration::from_secs(60));
    }
    assert_eq!(harness.agent.session().state(), HandshakeState::Handshaking);
    harness.server_send(FINISHED);
    harness.run_until(|agent| agent.session().state() == HandshakeState::Established);
    assert_eq!(harness.events.borrow().established, vec![false, true]);
}

#[test]
pub fn traffic_postpones_nat_timer() {
    let mut harness = Harness::new(Duration::from_secs(5));
    harness.establish();

    harness.idle(Duration::from_secs(3));
    harness.server_send_message(b"ping");
    assert_eq!(harness.server_recv(), b"rec:ack:ping");

    harness.idle(Duration::from_millis(2100));
    assert_eq!(harness.engine.borrow().rehandshakes(), 0);

    harness.idle(Duration::from_millis(3000));
    assert_eq!(harness.engine.borrow().rehandshakes(), 1);
}

#[test]
pub fn nat_timeout_change_rearms_timer() {
    let mut harness = Harness::new(Duration::from_secs(40));
    harness.establish();
    harness.agent.services_mut().set_nat_timeout(5).unwrap();
    assert!(harness.agent.services_mut().set_nat_timeout(0).is_err());

    harness.idle(Duration::from_millis(5100));
    assert_eq!(harness.engine.borrow().rehandshakes(), 1);
}

#[test]
pub fn clock_change_applied_after_response() {
    let mut harness = Harness::new(Duration::from_secs(40));
    harness.establish();

    harness.server_send_message(b"settime");
    assert_eq!(harness.server_recv(), b"rec:ack:settime");
    assert_eq!(harness.server_recv(), CLIENT_HELLO);
    assert_eq!(harness.clock.wall(), SystemTime::UNIX_EPOCH + SERVER_TIME);
    assert_eq!(harness.engine.borrow().handshakes.last(), Some(&(true, true)));
    assert_eq!(harness.events.borrow().rehandshakes, vec![true]);
}

#[test]
pub fn push_completes_on_acknowledgement() {
    let mut harness = Harness::new(Duration::from_secs(40));
    harness.establish();

    let outcome = Rc::new(RefCell::new(Vec::new()));
    let record = outcome.clone();
    harness
        .agent
        .push(
            "/push",
            b"tk",
            CONTENT_TYPE_CBOR,
            b"telemetry",
            Box::new(move |status| record.borrow_mut().push(status)),
        )
        .unwrap();
    assert_eq!(harness.server_recv(), b"rec:push:telemetry");
    assert!(harness.agent.services().channel.is_push_in_progress());
    assert!(outcome.borrow().is_empty());

    harness.server_send_message(b"ack-push:1");
    assert_eq!(*outcome.borrow(), vec![PushAckStatus::Success]);
    assert!(!harness.agent.services().channel.is_push_in_progress());
}

#[test]
pub fn datagrams_from_unknown_sources_ignored() {
    let mut harness = Harness::new(Duration::from_secs(40));
    harness.establish();

    let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    stranger.send_to(b"rec:intruder", harness.agent_addr).unwrap();
    harness.server_send_message(b"hello");
    assert_eq!(harness.core.borrow().messages, vec![b"hello".to_vec()]);
}

#[test]
pub fn close_and_shutdown() {
    let mut harness = Harness::new(Duration::from_secs(40));
    harness.establish();
    harness.agent.close().unwrap();
    assert!(!harness.agent.transport().is_open());
    assert_eq!(harness.agent.session().state(), HandshakeState::Idle);
    assert!(harness.agent.send(b"late").is_err());
    harness.agent.shutdown().unwrap();
}

#[test]
pub fn file_store_below_configured_root() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfigBuilder::new().store_root(dir.path()).build().unwrap();
    let mut agent = Agent::with_file_store(
        config,
        Rc::new(ManualClock::new()),
        Box::new(ScriptedEngine {
            log: Rc::new(RefCell::new(EngineLog::default())),
        }),
        Box::new(ScriptedCore {
            log: Rc::new(RefCell::new(CoreLog::default())),
            next_message_id: 0,
        }),
        Box::new(IdleDownloader),
        Rc::new(RefCell::new(NoopEventHandler)),
    )
    .unwrap();
    agent
        .services_mut()
        .credentials
        .set(CredentialId::DmAddress, b"coaps://dm.example")
        .unwrap();

    let reopened = CredentialStore::new(Rc::new(FileSecureStorage::new(dir.path())));
    assert_eq!(reopened.get(CredentialId::DmAddress).unwrap(), b"coaps://dm.example");
}

#[test]
pub fn temporary_resolve_failure_retried_from_timer() {
    let resolver = FlakyResolver::new(2);
    let calls = resolver.calls.clone();
    let mut harness = Harness::with_agent(Duration::from_secs(40), |agent| agent.with_resolver(Box::new(resolver)));
    let port = harness.server.local_addr().unwrap().port();

    harness
        .agent
        .start_session(ServerKind::DeviceManagement, "dm.example", port)
        .unwrap();
    assert!(harness.agent.is_session_pending());
    assert_eq!(harness.agent.session().state(), HandshakeState::Idle);
    assert_eq!(calls.get(), 1);

    harness.idle(Duration::from_millis(50));
    assert_eq!(calls.get(), 1);
    harness.idle(Duration::from_millis(50));
    assert_eq!(calls.get(), 2);
    assert!(harness.agent.is_session_pending());

    harness.idle(Duration::from_millis(100));
    assert_eq!(calls.get(), 3);
    assert!(!harness.agent.is_session_pending());
    assert_eq!(harness.agent.session().state(), HandshakeState::Handshaking);
    assert_eq!(harness.server_recv(), CLIENT_HELLO);
}

#[test]
pub fn resolve_retries_exhausted() {
    let resolver = FlakyResolver::new(u32::MAX);
    let calls = resolver.calls.clone();
    let mut harness = Harness::with_agent(Duration::from_secs(40), |agent| agent.with_resolver(Box::new(resolver)));

    harness
        .agent
        .start_session(ServerKind::DeviceManagement, "dm.example", 5684)
        .unwrap();
    for _ in 0..5 {
        assert!(harness.agent.is_session_pending());
        harness.idle(Duration::from_millis(100));
    }
    assert_eq!(calls.get(), 6);
    assert!(!harness.agent.is_session_pending());
    assert_eq!(harness.events.borrow().failed, 1);
    assert_eq!(harness.agent.session().state(), HandshakeState::Idle);
    assert!(harness.engine.borrow().handshakes.is_empty());
}
