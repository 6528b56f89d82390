// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * tests/common/mod.rs - Common code for integration tests.
 */

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    rc::Rc,
    time::{Duration, SystemTime},
};

use avc_agent::{
    channel::{PushAckStatus, PushMessage},
    config::AgentConfigBuilder,
    credentials::{CredentialId, CredentialStore, MemoryStorage},
    download::{DownloadFailure, PackageDownloader},
    integrity::PackageType,
    session::{DtlsEngine, EngineOutput, HandshakeState, SecurityMaterial, ServerKind},
    time::ManualClock,
    error::ResolveError,
    transport::{AddressFamily, Resolver},
    Agent, AgentEventHandler, CoreOutput, Lwm2mCore, Services, SharedEventHandler,
};
use tracing_subscriber::EnvFilter;
use url::Url;

/// First record sent by [ScriptedEngine] for every handshake.
pub const CLIENT_HELLO: &[u8] = b"client-hello";
/// Record completing a handshake successfully.
pub const FINISHED: &[u8] = b"finished";
/// Prefix of application data records.
pub const RECORD_PREFIX: &[u8] = b"rec:";
/// Wall-clock time set by a `settime` message.
pub const SERVER_TIME: Duration = Duration::from_secs(1_700_000_000);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Handshakes started on a [ScriptedEngine], as `(renegotiate, force_new_keys)`.
#[derive(Debug, Default)]
pub struct EngineLog {
    pub handshakes: Vec<(bool, bool)>,
}

impl EngineLog {
    pub fn rehandshakes(&self) -> usize {
        self.handshakes.iter().filter(|(renegotiate, _)| *renegotiate).count()
    }
}

/// DTLS engine "protecting" records by prefixing them with [RECORD_PREFIX].
pub struct ScriptedEngine {
    pub log: Rc<RefCell<EngineLog>>,
}

impl DtlsEngine for ScriptedEngine {
    fn start_handshake(
        &mut self,
        _security: &SecurityMaterial,
        renegotiate: bool,
        force_new_keys: bool,
    ) -> Result<Vec<Vec<u8>>, String> {
        self.log.borrow_mut().handshakes.push((renegotiate, force_new_keys));
        Ok(vec![CLIENT_HELLO.to_vec()])
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, String> {
        Ok([RECORD_PREFIX, plaintext].concat())
    }

    fn process(&mut self, record: &[u8]) -> Result<EngineOutput, String> {
        if record == FINISHED {
            return Ok(EngineOutput {
                handshake_complete: Some(true),
                ..Default::default()
            });
        }
        match record.strip_prefix(RECORD_PREFIX) {
            Some(plaintext) => Ok(EngineOutput {
                plaintext: Some(plaintext.to_vec()),
                ..Default::default()
            }),
            None => Err("unexpected record".to_string()),
        }
    }
}

/// Messages seen by a [ScriptedCore].
#[derive(Debug, Default)]
pub struct CoreLog {
    pub messages: Vec<Vec<u8>>,
    pub established: usize,
}

/// LwM2M core answering every message with `ack:<message>`.
///
/// `settime` requests a device time change to [SERVER_TIME], `ack-push:<id>` acknowledges a push.
pub struct ScriptedCore {
    pub log: Rc<RefCell<CoreLog>>,
    pub next_message_id: u16,
}

impl Lwm2mCore for ScriptedCore {
    fn handle_message(&mut self, message: &[u8], services: &mut Services) -> CoreOutput {
        self.log.borrow_mut().messages.push(message.to_vec());
        if let Some(id) = message.strip_prefix(b"ack-push:") {
            let id = String::from_utf8_lossy(id).parse().expect("invalid push id");
            return CoreOutput {
                responses: Vec::new(),
                push_acks: vec![(id, PushAckStatus::Success)],
            };
        }
        if message == b"settime" {
            services.set_device_current_time(SystemTime::UNIX_EPOCH + SERVER_TIME);
        }
        CoreOutput {
            responses: vec![[b"ack:".as_slice(), message].concat()],
            push_acks: Vec::new(),
        }
    }

    fn encode_push(&mut self, message: &PushMessage) -> Result<(u16, Vec<u8>), String> {
        self.next_message_id += 1;
        Ok((self.next_message_id, [b"push:".as_slice(), &message.payload].concat()))
    }

    fn on_session_established(&mut self, _services: &mut Services) -> CoreOutput {
        self.log.borrow_mut().established += 1;
        CoreOutput::default()
    }
}

/// Downloader that accepts every request and fetches nothing.
#[derive(Debug, Default)]
pub struct IdleDownloader;

impl PackageDownloader for IdleDownloader {
    fn start(&mut self, _package_type: PackageType, _uri: &Url) -> Result<(), String> {
        Ok(())
    }

    fn resume(&mut self, _package_type: PackageType, _uri: &Url, _offset: u64) -> Result<(), String> {
        Ok(())
    }

    fn abort(&mut self) {}
}

/// Records agent events.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    pub established: Vec<bool>,
    pub failed: usize,
    pub rehandshakes: Vec<bool>,
    pub download_failures: Vec<(PackageType, DownloadFailure)>,
    pub downloads_complete: Vec<PackageType>,
    pub downloads_aborted: Vec<PackageType>,
    pub install_results: Vec<(PackageType, bool)>,
}

impl AgentEventHandler for RecordingEvents {
    fn handle_session_established(&mut self, rehandshake: bool) {
        self.established.push(rehandshake);
    }

    fn handle_session_failed(&mut self) {
        self.failed += 1;
    }

    fn handle_rehandshake(&mut self, force_new_keys: bool) {
        self.rehandshakes.push(force_new_keys);
    }

    fn handle_download_complete(&mut self, package_type: PackageType) {
        self.downloads_complete.push(package_type);
    }

    fn handle_download_failed(&mut self, package_type: PackageType, failure: DownloadFailure) {
        self.download_failures.push((package_type, failure));
    }

    fn handle_download_aborted(&mut self, package_type: PackageType) {
        self.downloads_aborted.push(package_type);
    }

    fn handle_install_result(&mut self, package_type: PackageType, success: bool) {
        self.install_results.push((package_type, success));
    }
}

/// Resolver answering `EAI_AGAIN` a fixed number of times, then the loopback address.
pub struct FlakyResolver {
    pub failures: u32,
    pub calls: Rc<Cell<u32>>,
}

impl FlakyResolver {
    pub fn new(failures: u32) -> FlakyResolver {
        FlakyResolver {
            failures,
            calls: Rc::new(Cell::new(0)),
        }
    }
}

impl Resolver for FlakyResolver {
    fn resolve(&self, host: &str, port: u16, _family: AddressFamily) -> Result<Vec<SocketAddr>, ResolveError> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        if call < self.failures {
            return Err(ResolveError::TemporaryFailure(host.to_string()));
        }
        Ok(vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)])
    }
}

/// An agent talking to a scripted server socket on the loopback interface.
pub struct Harness {
    pub agent: Agent,
    pub clock: ManualClock,
    pub server: UdpSocket,
    pub agent_addr: SocketAddr,
    pub engine: Rc<RefCell<EngineLog>>,
    pub core: Rc<RefCell<CoreLog>>,
    pub events: Rc<RefCell<RecordingEvents>>,
}

impl Harness {
    /// Creates an open agent with DM pre-shared keys provisioned.
    pub fn new(nat_timeout: Duration) -> Harness {
        Harness::with_agent(nat_timeout, |agent| agent)
    }

    /// Like [Harness::new], `customize` may replace collaborators before the socket is opened.
    pub fn with_agent(nat_timeout: Duration, customize: impl FnOnce(Agent) -> Agent) -> Harness {
        init_tracing();
        let storage = Rc::new(MemoryStorage::new());
        let credentials = CredentialStore::new(storage.clone());
        credentials
            .set(CredentialId::DmPublicKey, b"urn:imei:351234567890123")
            .unwrap();
        credentials.set(CredentialId::DmSecretKey, &[0x5a; 16]).unwrap();

        let config = AgentConfigBuilder::new()
            .local_port(0)
            .family(AddressFamily::Ipv4)
            .nat_timeout(nat_timeout)
            .build()
            .unwrap();
        let clock = ManualClock::new();
        let engine = Rc::new(RefCell::new(EngineLog::default()));
        let core = Rc::new(RefCell::new(CoreLog::default()));
        let events = Rc::new(RefCell::new(RecordingEvents::default()));
        let handler: SharedEventHandler = events.clone();

        let agent = Agent::new(
            config,
            storage,
            Rc::new(clock.clone()),
            Box::new(ScriptedEngine { log: engine.clone() }),
            Box::new(ScriptedCore {
                log: core.clone(),
                next_message_id: 0,
            }),
            Box::new(IdleDownloader),
            handler,
        )
        .unwrap();
        let mut agent = customize(agent);
        let local = agent.open().unwrap();
        let agent_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port());

        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        Harness {
            agent,
            clock,
            server,
            agent_addr,
            engine,
            core,
            events,
        }
    }

    /// Starts a session with the server socket and completes the handshake.
    pub fn establish(&mut self) {
        let port = self.server.local_addr().unwrap().port();
        self.agent
            .start_session(ServerKind::DeviceManagement, "127.0.0.1", port)
            .unwrap();
        assert_eq!(self.server_recv(), CLIENT_HELLO);
        self.server_send(FINISHED);
        self.run_until(|agent| agent.session().state() == HandshakeState::Established);
    }

    pub fn server_send(&self, data: &[u8]) {
        self.server.send_to(data, self.agent_addr).unwrap();
    }

    pub fn server_recv(&self) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (len, _) = self.server.recv_from(&mut buf).expect("no datagram from the agent");
        buf[..len].to_vec()
    }

    /// Sends an application data record to the agent and waits until the core has seen it.
    pub fn server_send_message(&mut self, message: &[u8]) {
        let seen = self.core.borrow().messages.len();
        self.server_send(&[RECORD_PREFIX, message].concat());
        let core = self.core.clone();
        self.run_until(move |_| core.borrow().messages.len() > seen);
    }

    /// Runs the event loop until `done` holds, without moving the clock.
    pub fn run_until(&mut self, done: impl Fn(&Agent) -> bool) {
        for _ in 0..50 {
            if done(&self.agent) {
                return;
            }
            self.agent.run_once(Some(Duration::from_millis(100))).unwrap();
        }
        assert!(done(&self.agent), "condition not reached");
    }

    /// Moves the clock forward by `by` and fires due timers.
    pub fn idle(&mut self, by: Duration) {
        self.clock.advance(by);
        self.agent.run_once(Some(Duration::ZERO)).unwrap();
    }
}
