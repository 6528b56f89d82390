// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * event.rs - Event handler trait of the agent.
 */

//! Event handling-related code

use std::{cell::RefCell, fmt::Debug, rc::Rc};

use crate::{download::DownloadFailure, integrity::PackageType};

/// Event handler shared between the agent components.
pub type SharedEventHandler = Rc<RefCell<dyn AgentEventHandler>>;

/// Trait for agent event handlers.
///
/// Implementations are notified of session and package download events. Handlers are called
/// from within agent operations and must not call back into the agent.
pub trait AgentEventHandler: Debug {
    /// Handle a DTLS session established event.
    ///
    /// Triggered when a handshake or rehandshake completes successfully.
    #[allow(unused_variables)]
    fn handle_session_established(&mut self, rehandshake: bool) {}

    /// Handle a DTLS handshake failure.
    #[allow(unused_variables)]
    fn handle_session_failed(&mut self) {}

    /// Handle a rehandshake initiated by the NAT timer or a clock change.
    #[allow(unused_variables)]
    fn handle_rehandshake(&mut self, force_new_keys: bool) {}

    /// Handle the start of a package download.
    #[allow(unused_variables)]
    fn handle_download_started(&mut self, package_type: PackageType) {}

    /// Handle download progress, `percent` is in `0..=100`.
    ///
    /// Only emitted if the package size is known, and only when the percentage changes.
    #[allow(unused_variables)]
    fn handle_download_progress(&mut self, package_type: PackageType, percent: u8) {}

    /// Handle a completed and verified package download.
    #[allow(unused_variables)]
    fn handle_download_complete(&mut self, package_type: PackageType) {}

    /// Handle a failed package download.
    #[allow(unused_variables)]
    fn handle_download_failed(&mut self, package_type: PackageType, failure: DownloadFailure) {}

    /// Handle an aborted package download.
    #[allow(unused_variables)]
    fn handle_download_aborted(&mut self, package_type: PackageType) {}

    /// Handle the result of a package installation.
    #[allow(unused_variables)]
    fn handle_install_result(&mut self, package_type: PackageType, success: bool) {}
}

/// Event handler ignoring every event.
#[derive(Debug, Default)]
pub struct NoopEventHandler;

impl AgentEventHandler for NoopEventHandler {}
