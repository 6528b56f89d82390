// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * lib.rs - Main library entry point of the device-side LwM2M agent core.
 */

//! Device-side core of an LwM2M agent.
//!
//! This crate contains the parts of a device management agent that sit below the LwM2M object
//! model: the secure UDP/DTLS transport to the bootstrap and device management servers, the
//! credential store, the verification of firmware and software packages, the persistent update
//! state and the CoAP application data channel.
//!
//! # Feature support
//! - [x] UDP transport bound to the wildcard address or the active cellular profile
//! - [x] DTLS sessions, driven by a [DtlsEngine](session::DtlsEngine) implementation
//!     - [x] Pre-shared keys (feature `dtls-psk`)
//!     - [x] Certificates (feature `dtls-pki`)
//! - [x] NAT keep-alive through session renegotiation
//! - [x] Credential store with atomic writes
//! - [x] Package download with resumable SHA-1 digest and RSASSA-PSS signature check
//! - [x] Block-wise application data channel (receive, serve, push)
//! - [ ] CoAP message codec and LwM2M object model (provided by a [Lwm2mCore] implementation)
//!
//! # Example
//!
//! ```no_run
//! use std::{cell::RefCell, rc::Rc, time::Duration};
//!
//! use avc_agent::{
//!     channel::PushMessage,
//!     config::AgentConfigBuilder,
//!     download::PackageDownloader,
//!     integrity::PackageType,
//!     session::{DtlsEngine, EngineOutput, SecurityMaterial, ServerKind},
//!     time::SystemClock,
//!     Agent, CoreOutput, Lwm2mCore, NoopEventHandler, Services,
//! };
//! use url::Url;
//!
//! struct Engine;
//!
//! impl DtlsEngine for Engine {
//!     fn start_handshake(&mut self, _: &SecurityMaterial, _: bool, _: bool) -> Result<Vec<Vec<u8>>, String> {
//!         Ok(Vec::new())
//!     }
//!
//!     fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, String> {
//!         Ok(plaintext.to_vec())
//!     }
//!
//!     fn process(&mut self, _: &[u8]) -> Result<EngineOutput, String> {
//!         Ok(EngineOutput::default())
//!     }
//! }
//!
//! struct Core;
//!
//! impl Lwm2mCore for Core {
//!     fn handle_message(&mut self, _: &[u8], _: &mut Services) -> CoreOutput {
//!         CoreOutput::default()
//!     }
//!
//!     fn encode_push(&mut self, _: &PushMessage) -> Result<(u16, Vec<u8>), String> {
//!         Err("push not supported".to_string())
//!     }
//! }
//!
//! struct Downloader;
//!
//! impl PackageDownloader for Downloader {
//!     fn start(&mut self, _: PackageType, _: &Url) -> Result<(), String> {
//!         Ok(())
//!     }
//!
//!     fn resume(&mut self, _: PackageType, _: &Url, _: u64) -> Result<(), String> {
//!         Ok(())
//!     }
//!
//!     fn abort(&mut self) {}
//! }
//!
//! let config = AgentConfigBuilder::new()
//!     .store_root("/var/lib/avc")
//!     .build()
//!     .expect("invalid configuration");
//! let mut agent = Agent::with_file_store(
//!     config,
//!     Rc::new(SystemClock::new()),
//!     Box::new(Engine),
//!     Box::new(Core),
//!     Box::new(Downloader),
//!     Rc::new(RefCell::new(NoopEventHandler)),
//! )
//! .expect("unable to create agent");
//!
//! agent.init().expect("unable to restore state");
//! agent.open().expect("unable to open socket");
//! agent
//!     .start_session_from_credentials(ServerKind::DeviceManagement)
//!     .expect("unable to start session");
//! loop {
//!     agent.run_once(Some(Duration::from_secs(1))).expect("event loop failure");
//! }
//! ```

pub use agent::{Agent, CoreOutput, Lwm2mCore, Services};
pub use error::Status;
pub use event::{AgentEventHandler, NoopEventHandler, SharedEventHandler};

mod agent;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod download;
pub mod error;
mod event;
pub mod integrity;
pub mod keepalive;
pub mod platform;
pub mod session;
pub mod time;
pub mod transport;
pub mod update;
