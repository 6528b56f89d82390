// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * agent.rs - Agent instance and event loop.
 */

//! The agent instance and its event loop.
//!
//! An [Agent] owns every component of the device-side core: the UDP transport, the DTLS session,
//! the credential and update-state stores, the package download controller, the application
//! channel and the NAT keep-alive. The LwM2M protocol itself is implemented by a [Lwm2mCore]
//! collaborator, which receives decrypted messages together with a [Services] handle.
//!
//! The agent is driven by calling [Agent::run_once] repeatedly, which waits for socket readiness
//! or the next timer deadline, whichever comes first.

use std::{
    net::SocketAddr,
    rc::Rc,
    time::{Duration, SystemTime},
};

use mio::{Events, Poll, Token};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    channel::{AppChannel, PushAckStatus, PushCallback, PushMessage, PushSender},
    config::AgentConfig,
    credentials::{CredentialStore, FileSecureStorage, SecureStorage},
    download::{DownloadController, DownloadInfo, PackageDownloader},
    error::{AgentError, ConfigError, DownloadError, ResolveError, SessionError, TransportError},
    event::SharedEventHandler,
    keepalive::NatKeepAlive,
    platform,
    session::{DtlsEngine, DtlsSession, SecurityMaterial, ServerKind},
    time::{Clock, ClockAdjuster, TimerId, Timers},
    transport::{CellularProfile, Datagram, DataConnection, Resolver, SystemResolver, UdpTransport},
    update::UpdateStateStore,
};

/// Token of the UDP socket in the readiness watcher.
pub const TRANSPORT_TOKEN: Token = Token(0);
/// Default port of `coap` server URIs.
pub const COAP_DEFAULT_PORT: u16 = 5683;
/// Default port of `coaps` server URIs.
pub const COAPS_DEFAULT_PORT: u16 = 5684;

const EVENT_CAPACITY: usize = 16;

/// Components made available to the [Lwm2mCore] while it handles a message.
#[derive(Debug)]
pub struct Services {
    pub credentials: CredentialStore,
    pub update: UpdateStateStore,
    pub download: DownloadController,
    pub channel: AppChannel,
    pub clock_adjuster: ClockAdjuster,
    pub keepalive: NatKeepAlive,
    pub timers: Timers,
    now: Duration,
}

impl Services {
    /// Monotonic time at which the current event is handled.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Changes the NAT inactivity timeout.
    pub fn set_nat_timeout(&mut self, seconds: u32) -> Result<(), ConfigError> {
        self.keepalive.set_nat_timeout(&mut self.timers, self.now, seconds)
    }

    /// Defers a wall-clock change until the current response has been sent.
    pub fn set_device_current_time(&mut self, time: SystemTime) {
        self.clock_adjuster.set_device_current_time(time);
    }

    /// Schedules a retry of an interrupted package download.
    pub fn request_download_retry(&mut self) -> Result<Duration, DownloadError> {
        self.download.request_retry(&mut self.timers, self.now)
    }
}

/// Messages produced by the [Lwm2mCore].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CoreOutput {
    /// Encoded CoAP messages to send to the server.
    pub responses: Vec<Vec<u8>>,
    /// Acknowledgements of push messages received from the server.
    pub push_acks: Vec<(u16, PushAckStatus)>,
}

/// The LwM2M protocol engine (CoAP codec, object model and registration).
pub trait Lwm2mCore {
    /// Handles a decrypted CoAP message received from the server.
    fn handle_message(&mut self, message: &[u8], services: &mut Services) -> CoreOutput;

    /// Encodes a push block as a confirmable CoAP message, returning its message id and bytes.
    fn encode_push(&mut self, message: &PushMessage) -> Result<(u16, Vec<u8>), String>;

    /// Called once a handshake completed, typically to register or update the registration.
    #[allow(unused_variables)]
    fn on_session_established(&mut self, services: &mut Services) -> CoreOutput {
        CoreOutput::default()
    }

    /// Called on every expiry of the step timer.
    #[allow(unused_variables)]
    fn step(&mut self, services: &mut Services) -> CoreOutput {
        CoreOutput::default()
    }
}

/// Data connection used if the platform does not provide one, every destination is assumed to
/// be reachable through the default route.
#[derive(Debug, Default)]
struct DefaultRouteOnly;

impl DataConnection for DefaultRouteOnly {
    fn has_default_route(&self) -> bool {
        true
    }

    fn add_route(&mut self, _destination: std::net::IpAddr, _channel: Option<&crate::config::DataChannel>) -> Result<(), String> {
        Err("no data connection service available".to_string())
    }
}

/// Session start waiting for a name resolution retry.
#[derive(Debug, Clone)]
struct PendingConnect {
    server: ServerKind,
    host: String,
    port: u16,
    attempt: u32,
}

/// Sends push blocks through the DTLS session.
struct SessionPushSender<'a> {
    core: &'a mut dyn Lwm2mCore,
    session: &'a mut DtlsSession,
    transport: &'a UdpTransport,
    keepalive: &'a mut NatKeepAlive,
    timers: &'a mut Timers,
    now: Duration,
}

impl PushSender for SessionPushSender<'_> {
    fn send_push(&mut self, message: &PushMessage) -> Result<u16, String> {
        let (message_id, encoded) = self.core.encode_push(message)?;
        self.session
            .send(self.transport, &encoded, self.now)
            .map_err(|e| e.to_string())?;
        self.keepalive.on_traffic(self.timers, self.now);
        Ok(message_id)
    }
}

/// A device-side agent instance.
pub struct Agent {
    config: AgentConfig,
    clock: Rc<dyn Clock>,
    poll: Poll,
    events: Events,
    transport: UdpTransport,
    session: DtlsSession,
    services: Services,
    core: Box<dyn Lwm2mCore>,
    resolver: Box<dyn Resolver>,
    data_connection: Box<dyn DataConnection>,
    profile: Option<Box<dyn CellularProfile>>,
    event_handler: SharedEventHandler,
    server: Option<ServerKind>,
    pending_connect: Option<PendingConnect>,
    established_before: bool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("session", &self.session)
            .field("services", &self.services)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Creates an agent storing its persistent state in `storage`.
    ///
    /// Name resolution uses the system resolver and every destination is assumed to be
    /// reachable through the default route, see [Agent::with_resolver] and
    /// [Agent::with_data_connection].
    pub fn new(
        config: AgentConfig,
        storage: Rc<dyn SecureStorage>,
        clock: Rc<dyn Clock>,
        engine: Box<dyn DtlsEngine>,
        core: Box<dyn Lwm2mCore>,
        downloader: Box<dyn PackageDownloader>,
        event_handler: SharedEventHandler,
    ) -> Result<Agent, AgentError> {
        let poll = Poll::new().map_err(AgentError::Poll)?;
        let services = Services {
            credentials: CredentialStore::new(storage.clone()),
            update: UpdateStateStore::new(storage.clone()),
            download: DownloadController::new(storage, downloader, event_handler.clone()),
            channel: AppChannel::new(config.max_coap_payload, config.stream_max()),
            clock_adjuster: ClockAdjuster::with_sources(config.clock_sources.clone()),
            keepalive: NatKeepAlive::new(config.nat_timeout),
            timers: Timers::new(),
            now: clock.monotonic(),
        };
        Ok(Agent {
            config,
            clock,
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            transport: UdpTransport::new(TRANSPORT_TOKEN),
            session: DtlsSession::new(engine),
            services,
            core,
            resolver: Box::new(SystemResolver::new()),
            data_connection: Box::new(DefaultRouteOnly),
            profile: None,
            event_handler,
            server: None,
            pending_connect: None,
            established_before: false,
        })
    }

    /// Creates an agent storing its persistent state in files below the configured store root.
    pub fn with_file_store(
        config: AgentConfig,
        clock: Rc<dyn Clock>,
        engine: Box<dyn DtlsEngine>,
        core: Box<dyn Lwm2mCore>,
        downloader: Box<dyn PackageDownloader>,
        event_handler: SharedEventHandler,
    ) -> Result<Agent, AgentError> {
        let storage = Rc::new(FileSecureStorage::new(&config.store_root));
        Agent::new(config, storage, clock, engine, core, downloader, event_handler)
    }

    pub fn with_resolver(mut self, resolver: Box<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_data_connection(mut self, data_connection: Box<dyn DataConnection>) -> Self {
        self.data_connection = data_connection;
        self
    }

    /// Sets the cellular profile whose address the socket binds to.
    pub fn with_cellular_profile(mut self, profile: Box<dyn CellularProfile>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn session(&self) -> &DtlsSession {
        &self.session
    }

    pub fn transport(&self) -> &UdpTransport {
        &self.transport
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut Services {
        self.services.now = self.clock.monotonic();
        &mut self.services
    }

    /// Restores persisted state after a start of the device.
    ///
    /// The wall clock is moved to the last-resort time if it lags behind it, and an interrupted
    /// package download is restored from its checkpoint.
    pub fn init(&mut self) -> Result<Option<DownloadInfo>, AgentError> {
        if let Some(last_resort) = self.config.last_resort_time {
            if self.clock.wall() < last_resort {
                info!(?last_resort, "wall clock behind last-resort time, adjusting");
                self.clock.set_wall(last_resort);
            }
        }
        if let Some(source) = self.services.clock_adjuster.preferred_source() {
            debug!(kind = ?source.kind, server = ?source.server, "preferred clock source");
        }
        let restored = self.services.download.resume_from_storage()?;
        if let Some(info) = &restored {
            info!(state = ?info.state, received = info.received, "interrupted download restored");
        }
        Ok(restored)
    }

    /// Opens the UDP socket, returning its local address.
    pub fn open(&mut self) -> Result<SocketAddr, AgentError> {
        let local_addr = self
            .transport
            .open(self.poll.registry(), &self.config, self.profile.as_deref())?;
        Ok(local_addr)
    }

    /// Starts a DTLS session with `server` at `host` and `port`.
    ///
    /// The host is resolved and a route to it is installed if needed, then the handshake is
    /// started with the security material provisioned for `server`.
    ///
    /// A temporary name resolution failure is retried from the event loop, up to
    /// [AgentConfig::resolve_retries] times. `Ok` is returned while a retry is pending, see
    /// [Agent::is_session_pending].
    pub fn start_session(&mut self, server: ServerKind, host: &str, port: u16) -> Result<(), AgentError> {
        self.services.timers.stop(TimerId::ResolveRetry);
        self.pending_connect = None;
        self.connect_session(server, host, port, 0)
    }

    /// Returns whether a session start waits for a name resolution retry.
    pub fn is_session_pending(&self) -> bool {
        self.pending_connect.is_some()
    }

    fn connect_session(&mut self, server: ServerKind, host: &str, port: u16, attempt: u32) -> Result<(), AgentError> {
        if !self.transport.is_open() {
            return Err(TransportError::NotOpen.into());
        }
        let connected = match self.transport.connect(
            self.resolver.as_ref(),
            self.data_connection.as_mut(),
            &self.config,
            host,
            port,
            self.config.family,
        ) {
            Ok(connected) => connected,
            Err(TransportError::Resolve(ResolveError::TemporaryFailure(_))) if attempt < self.config.resolve_retries => {
                let now = self.clock.monotonic();
                debug!(host, attempt = attempt + 1, "name resolution retry scheduled");
                self.pending_connect = Some(PendingConnect {
                    server,
                    host: host.to_string(),
                    port,
                    attempt: attempt + 1,
                });
                self.services
                    .timers
                    .arm_once(TimerId::ResolveRetry, now, self.config.resolve_retry_delay);
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        };
        let security = SecurityMaterial::load(&self.services.credentials, server)?;
        let now = self.clock.monotonic();
        self.services.now = now;
        self.services.keepalive.stop(&mut self.services.timers);
        self.services.timers.stop(TimerId::Rehandshake);
        self.session.configure(connected.peer, security);
        self.server = Some(server);
        self.established_before = false;
        info!(?server, host, peer = %connected.peer, "starting session");
        if let Err(e) = self.session.handshake(&self.transport, now) {
            self.on_handshake_failed(now);
            return Err(e.into());
        }
        self.on_handshake_started(now);
        Ok(())
    }

    /// Starts a DTLS session with the server whose URI is provisioned for `server`.
    pub fn start_session_from_credentials(&mut self, server: ServerKind) -> Result<(), AgentError> {
        let raw = self.services.credentials.get(server.address())?;
        let address = String::from_utf8_lossy(&raw).into_owned();
        let uri = Url::parse(address.trim()).map_err(|_| AgentError::InvalidServerAddress(address.clone()))?;
        let default_port = match uri.scheme() {
            "coaps" => COAPS_DEFAULT_PORT,
            "coap" => COAP_DEFAULT_PORT,
            _ => return Err(AgentError::InvalidServerAddress(address)),
        };
        let host = uri
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .ok_or_else(|| AgentError::InvalidServerAddress(address.clone()))?;
        let port = uri.port().unwrap_or(default_port);
        self.start_session(server, host, port)
    }

    /// Encrypts and sends a message originated by the LwM2M core.
    pub fn send(&mut self, message: &[u8]) -> Result<usize, AgentError> {
        let now = self.clock.monotonic();
        let sent = self.session.send(&self.transport, message, now)?;
        self.services.keepalive.on_traffic(&mut self.services.timers, now);
        Ok(sent)
    }

    /// Pushes application data to the server, see [AppChannel::push].
    pub fn push(
        &mut self,
        uri: &str,
        token: &[u8],
        content_type: u16,
        data: &[u8],
        callback: PushCallback,
    ) -> Result<(), AgentError> {
        let now = self.clock.monotonic();
        let services = &mut self.services;
        let mut sender = SessionPushSender {
            core: self.core.as_mut(),
            session: &mut self.session,
            transport: &self.transport,
            keepalive: &mut services.keepalive,
            timers: &mut services.timers,
            now,
        };
        services
            .channel
            .push(&mut sender, uri, token, content_type, data, callback)?;
        Ok(())
    }

    /// Arms the periodic step timer, or stops it for `None`.
    pub fn set_step_interval(&mut self, interval: Option<Duration>) {
        match interval {
            Some(interval) => self
                .services
                .timers
                .arm_periodic(TimerId::Step, self.clock.monotonic(), interval),
            None => self.services.timers.stop(TimerId::Step),
        }
    }

    /// Runs one iteration of the event loop.
    ///
    /// Waits until the socket is readable, the next timer expires or `timeout` elapsed (forever
    /// if both are `None`). Received datagrams are processed in arrival order, then expired timers
    /// are fired. Returns the time spent.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<Duration, AgentError> {
        let started = self.clock.monotonic();
        let wait = match (timeout, self.services.timers.next_timeout(started)) {
            (Some(timeout), Some(next)) => Some(timeout.min(next)),
            (timeout, next) => timeout.or(next),
        };
        if let Err(e) = self.poll.poll(&mut self.events, wait) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                return Err(AgentError::Poll(e));
            }
        }
        let readable = self
            .events
            .iter()
            .any(|event| event.token() == self.transport.token() && event.is_readable());
        if readable {
            // Readiness is edge-triggered, the socket has to be drained.
            while let Some(datagram) = self.transport.drain_once() {
                self.handle_datagram(&datagram);
            }
        }
        self.fire_timers();
        Ok(self.clock.monotonic().saturating_sub(started))
    }

    fn handle_datagram(&mut self, datagram: &Datagram) {
        let now = self.clock.monotonic();
        self.services.now = now;
        if self.session.peer() != Some(datagram.from) {
            debug!(from = %datagram.from, "dropping datagram from unknown source");
            return;
        }
        let received = match self.session.receive(&self.transport, datagram, now) {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, len = datagram.data.len(), "unable to process datagram");
                platform::log_hex_dump("undecodable datagram", &datagram.data);
                return;
            },
        };
        match received.handshake_complete {
            Some(true) => self.on_handshake_established(now),
            Some(false) => self.on_handshake_failed(now),
            None => self.services.keepalive.on_traffic(&mut self.services.timers, now),
        }
        if let Some(plaintext) = received.plaintext {
            let output = self.core.handle_message(&plaintext, &mut self.services);
            self.apply_core_output(output, now);
            self.post_request(now);
        }
    }

    fn on_handshake_started(&mut self, now: Duration) {
        self.services
            .timers
            .arm_once(TimerId::HandshakeTimeout, now, self.config.handshake_timeout);
    }

    fn on_handshake_established(&mut self, now: Duration) {
        self.services.timers.stop(TimerId::HandshakeTimeout);
        self.services.timers.stop(TimerId::Rehandshake);
        self.services.keepalive.start(&mut self.services.timers, now);
        let rehandshake = self.established_before;
        self.established_before = true;
        self.event_handler.borrow_mut().handle_session_established(rehandshake);
        let output = self.core.on_session_established(&mut self.services);
        self.apply_core_output(output, now);
    }

    fn on_handshake_failed(&mut self, now: Duration) {
        self.services.timers.stop(TimerId::HandshakeTimeout);
        self.services.keepalive.stop(&mut self.services.timers);
        if let Some(retry_at) = self.session.retry_at() {
            self.services
                .timers
                .arm_once(TimerId::Rehandshake, now, retry_at.saturating_sub(now));
        }
        self.event_handler.borrow_mut().handle_session_failed();
    }

    fn apply_core_output(&mut self, output: CoreOutput, now: Duration) {
        for response in output.responses {
            match self.session.send(&self.transport, &response, now) {
                Ok(_) => self.services.keepalive.on_traffic(&mut self.services.timers, now),
                Err(e) => warn!(error = %e, "unable to send message"),
            }
        }
        let services = &mut self.services;
        for (message_id, status) in output.push_acks {
            let mut sender = SessionPushSender {
                core: self.core.as_mut(),
                session: &mut self.session,
                transport: &self.transport,
                keepalive: &mut services.keepalive,
                timers: &mut services.timers,
                now,
            };
            if !services.channel.on_push_ack(&mut sender, message_id, status) {
                debug!(message_id, "acknowledgement does not match a pending push");
            }
        }
    }

    /// Hooks that run after the response to a request has been sent.
    fn post_request(&mut self, now: Duration) {
        if self.services.clock_adjuster.apply_post_request(self.clock.as_ref()) {
            self.rehandshake(now, true);
        }
    }

    fn rehandshake(&mut self, now: Duration, force_new_keys: bool) {
        self.services.keepalive.stop(&mut self.services.timers);
        self.event_handler.borrow_mut().handle_rehandshake(force_new_keys);
        match self.session.rehandshake(&self.transport, now, force_new_keys) {
            Ok(()) => self.on_handshake_started(now),
            Err(SessionError::BackingOff(delay)) => {
                debug!(delay_ms = delay.as_millis() as u64, "rehandshake deferred");
                self.services.timers.arm_once(TimerId::Rehandshake, now, delay);
            },
            Err(SessionError::HandshakeInProgress) => debug!("handshake already in progress"),
            Err(e) => {
                warn!(error = %e, "unable to start rehandshake");
                self.on_handshake_failed(now);
            },
        }
    }

    fn fire_timers(&mut self) {
        let now = self.clock.monotonic();
        self.services.now = now;
        for timer in self.services.timers.expire(now) {
            match timer {
                TimerId::NatKeepAlive => {
                    if self.services.keepalive.on_expired() {
                        self.rehandshake(now, false);
                    }
                },
                TimerId::Rehandshake => self.rehandshake(now, false),
                TimerId::HandshakeTimeout => {
                    if self.session.on_handshake_timeout(now).is_some() {
                        self.on_handshake_failed(now);
                    }
                },
                TimerId::ResolveRetry => {
                    if let Some(pending) = self.pending_connect.take() {
                        let result = self.connect_session(pending.server, &pending.host, pending.port, pending.attempt);
                        if let Err(e) = result {
                            warn!(error = %e, host = %pending.host, "unable to start session");
                            self.event_handler.borrow_mut().handle_session_failed();
                        }
                    }
                },
                TimerId::DownloadRetry => {
                    if let Err(e) = self.services.download.on_retry_timer() {
                        warn!(error = %e, "unable to resume package download");
                    }
                },
                TimerId::Step => {
                    let output = self.core.step(&mut self.services);
                    self.apply_core_output(output, now);
                },
            }
        }
    }

    /// Drops the DTLS session and closes the socket.
    pub fn close(&mut self) -> Result<(), AgentError> {
        self.session.close();
        self.services.keepalive.stop(&mut self.services.timers);
        self.services.timers.stop(TimerId::Rehandshake);
        self.services.timers.stop(TimerId::HandshakeTimeout);
        self.services.timers.stop(TimerId::ResolveRetry);
        self.pending_connect = None;
        self.server = None;
        self.transport.close(self.poll.registry())?;
        Ok(())
    }

    /// Shuts the agent down, checkpointing a running package download.
    pub fn shutdown(mut self) -> Result<(), AgentError> {
        if self.transport.is_open() {
            self.close()?;
        }
        if self.services.download.state().is_active() {
            if let Err(e) = self.services.download.suspend() {
                warn!(error = %e, "unable to checkpoint package download");
            }
        }
        info!("agent shut down");
        Ok(())
    }
}
