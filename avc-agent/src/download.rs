// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * download.rs - Package download controller.
 */

//! Package download controller.
//!
//! The controller drives a single firmware or software package download through
//!
//! ```text
//! Idle -> Started -> InProgress -> Completed -> Installed
//!                        |  ^
//!                        v  |  retry
//!                     Suspended
//! ```
//!
//! with `Failed` and `Aborted` as terminal states reachable from every active state. Bytes are
//! fetched by a [PackageDownloader] collaborator and reported through
//! [DownloadController::receive_data], which feeds them into the package digest. The update state
//! of the package type is persisted through the [UpdateStateStore] on every transition, and the
//! download offset and digest are checkpointed together so that an interrupted download resumes
//! after a reboot.

use std::{rc::Rc, time::Duration};

use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backoff::Backoff,
    credentials::{CredentialStore, SecureStorage},
    error::{DownloadError, UpdateStoreError},
    event::SharedEventHandler,
    integrity::{PackageType, PackageVerifier, SERIALIZED_LEN},
    time::{TimerId, Timers},
    update::{FwUpdateResult, FwUpdateState, SwUpdateResult, SwUpdateState, UpdateStateStore},
};

/// URI schemes accepted for package downloads.
pub const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "coap", "coaps"];
/// Number of received bytes between two automatic checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 64 * 1024;

const CHECKPOINT_VERSION: u8 = 1;
const CHECKPOINT_HEADER_LEN: usize = 1 + 1 + 8 + 8 + SERIALIZED_LEN;

/// State of the package download controller.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DownloadState {
    Idle,
    Started,
    InProgress,
    Suspended,
    Completed,
    Failed,
    Aborted,
    Installed,
}

impl DownloadState {
    /// Returns whether a download is running or waiting for a retry.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadState::Started | DownloadState::InProgress | DownloadState::Suspended
        )
    }
}

/// Reason for a failed download, mapped to the update result of the package type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DownloadFailure {
    NotEnoughSpace,
    OutOfMemory,
    ConnectionLost,
    IntegrityFailure,
    UnsupportedPackage,
    InvalidUri,
    UnsupportedProtocol,
    DeviceError,
}

impl DownloadFailure {
    pub fn fw_result(&self) -> FwUpdateResult {
        match self {
            DownloadFailure::NotEnoughSpace => FwUpdateResult::NotEnoughSpace,
            DownloadFailure::OutOfMemory => FwUpdateResult::OutOfMemory,
            DownloadFailure::ConnectionLost => FwUpdateResult::ConnectionLost,
            DownloadFailure::IntegrityFailure => FwUpdateResult::IntegrityCheckFailure,
            DownloadFailure::UnsupportedPackage => FwUpdateResult::UnsupportedPackageType,
            DownloadFailure::InvalidUri => FwUpdateResult::InvalidUri,
            DownloadFailure::UnsupportedProtocol => FwUpdateResult::UnsupportedProtocol,
            DownloadFailure::DeviceError => FwUpdateResult::UpdateFailed,
        }
    }

    pub fn sw_result(&self) -> SwUpdateResult {
        match self {
            DownloadFailure::NotEnoughSpace => SwUpdateResult::NotEnoughMemory,
            DownloadFailure::OutOfMemory => SwUpdateResult::OutOfMemory,
            DownloadFailure::ConnectionLost => SwUpdateResult::ConnectionLost,
            DownloadFailure::IntegrityFailure => SwUpdateResult::CheckFailure,
            DownloadFailure::UnsupportedPackage => SwUpdateResult::UnsupportedType,
            // Object 9 has no protocol result, the protocol is part of the URI.
            DownloadFailure::InvalidUri | DownloadFailure::UnsupportedProtocol => SwUpdateResult::InvalidUri,
            DownloadFailure::DeviceError => SwUpdateResult::DeviceError,
        }
    }
}

/// A package download requested by the server.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PackageRequest {
    pub package_type: PackageType,
    pub uri: String,
    /// Announced package size, zero if unknown.
    pub size: u64,
}

/// Snapshot of the controller returned by [DownloadController::get_info].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DownloadInfo {
    pub state: DownloadState,
    pub package_type: Option<PackageType>,
    pub uri: Option<String>,
    pub received: u64,
    pub size: u64,
    /// Download progress, if the package size is known.
    pub progress: Option<u8>,
}

/// Fetcher of package bytes (HTTP or CoAP client).
///
/// The downloader stores the package where the installer expects it and reports every chunk to
/// [DownloadController::receive_data], then the signature to
/// [DownloadController::end_of_package].
pub trait PackageDownloader {
    /// Starts fetching `uri` from the beginning.
    fn start(&mut self, package_type: PackageType, uri: &Url) -> Result<(), String>;

    /// Continues fetching `uri` from byte `offset`.
    fn resume(&mut self, package_type: PackageType, uri: &Url, offset: u64) -> Result<(), String>;

    /// Stops the running fetch, if any.
    fn abort(&mut self);
}

#[derive(Debug, Clone)]
struct ActiveDownload {
    package_type: PackageType,
    uri: Url,
    size: u64,
    received: u64,
    last_percent: Option<u8>,
    last_checkpoint: u64,
}

impl ActiveDownload {
    fn percent(&self) -> Option<u8> {
        (self.size > 0).then(|| (self.received.saturating_mul(100) / self.size).min(100) as u8)
    }

    fn all_received(&self) -> bool {
        self.size > 0 && self.received >= self.size
    }
}

/// The package download controller.
pub struct DownloadController {
    state: DownloadState,
    active: Option<ActiveDownload>,
    verifier: PackageVerifier,
    credentials: CredentialStore,
    update: UpdateStateStore,
    storage: Rc<dyn SecureStorage>,
    downloader: Box<dyn PackageDownloader>,
    events: SharedEventHandler,
    backoff: Backoff,
    checkpoint_interval: u64,
}

impl std::fmt::Debug for DownloadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadController")
            .field("state", &self.state)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl DownloadController {
    pub fn new(
        storage: Rc<dyn SecureStorage>,
        downloader: Box<dyn PackageDownloader>,
        events: SharedEventHandler,
    ) -> DownloadController {
        DownloadController {
            state: DownloadState::Idle,
            active: None,
            verifier: PackageVerifier::new(),
            credentials: CredentialStore::new(storage.clone()),
            update: UpdateStateStore::new(storage.clone()),
            storage,
            downloader,
            events,
            backoff: Backoff::default(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }

    /// Replaces the retry back-off.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the number of received bytes between two automatic checkpoints.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn update_store(&self) -> &UpdateStateStore {
        &self.update
    }

    /// Storage path of the download checkpoint of `package_type`.
    pub fn checkpoint_path(package_type: PackageType) -> String {
        UpdateStateStore::path(package_type, "resume")
    }

    /// Starts downloading the package described by `request`.
    ///
    /// # Errors
    /// - [DownloadError::InvalidState] if a download is already active.
    /// - [DownloadError::InvalidUri] if the URI does not parse or uses an unsupported scheme. The
    ///   invalid-URI result is persisted for the package type.
    /// - [DownloadError::Downloader] if the downloader refused to start, the download is then
    ///   suspended and can be retried.
    pub fn start(&mut self, request: PackageRequest) -> Result<(), DownloadError> {
        if self.state.is_active() {
            return Err(DownloadError::InvalidState(self.state));
        }
        let package_type = request.package_type;
        let uri = match Url::parse(&request.uri) {
            Ok(uri) if SUPPORTED_SCHEMES.contains(&uri.scheme()) => uri,
            _ => {
                warn!(uri = %request.uri, "rejecting invalid package URI");
                self.write_result(package_type, DownloadFailure::InvalidUri)?;
                return Err(DownloadError::InvalidUri(request.uri));
            },
        };

        self.verifier.cancel();
        self.verifier.start().map_err(crate::error::IntegrityError::from)?;
        self.delete_checkpoint(package_type);
        self.backoff.reset();
        self.active = Some(ActiveDownload {
            package_type,
            uri: uri.clone(),
            size: request.size,
            received: 0,
            last_percent: None,
            last_checkpoint: 0,
        });
        self.state = DownloadState::Started;

        self.persist(|update| match package_type {
            PackageType::Fw => {
                update.set_fw_update_state(FwUpdateState::Downloading)?;
                update.set_fw_update_result(FwUpdateResult::Normal)
            },
            PackageType::Sw => {
                update.set_sw_update_state(SwUpdateState::DownloadStarted)?;
                update.set_sw_update_result(SwUpdateResult::Downloading)
            },
        })?;

        // Resuming after a power cut needs a checkpoint even before the first interval.
        if let Err(e) = self.checkpoint() {
            self.verifier.cancel();
            self.state = DownloadState::Failed;
            return Err(e);
        }

        info!(?package_type, %uri, size = request.size, "package download started");
        self.events.borrow_mut().handle_download_started(package_type);

        if let Err(e) = self.downloader.start(package_type, &uri) {
            warn!(?package_type, error = %e, "downloader failed to start, download suspended");
            self.state = DownloadState::Suspended;
            return Err(DownloadError::Downloader(e));
        }
        Ok(())
    }

    /// Feeds a chunk of package data into the download.
    ///
    /// A zero-length chunk is accepted and ignored.
    ///
    /// # Errors
    /// - [DownloadError::MissingBuffer] if `data` is `None`.
    /// - [DownloadError::InvalidState] if no download is running.
    /// - [DownloadError::Oversized] if more bytes than announced were received, the download
    ///   fails with an integrity failure.
    pub fn receive_data(&mut self, data: Option<&[u8]>) -> Result<(), DownloadError> {
        let data = data.ok_or(DownloadError::MissingBuffer)?;
        if data.is_empty() {
            return Ok(());
        }
        if !matches!(self.state, DownloadState::Started | DownloadState::InProgress) {
            return Err(DownloadError::InvalidState(self.state));
        }
        let Some(active) = self.active.as_mut() else {
            return Err(DownloadError::InvalidState(self.state));
        };
        let received = active.received + data.len() as u64;
        if active.size > 0 && received > active.size {
            let size = active.size;
            warn!(received, size, "received more bytes than announced");
            self.fail(DownloadFailure::IntegrityFailure)?;
            return Err(DownloadError::Oversized { received, size });
        }
        self.verifier.process(data).map_err(crate::error::IntegrityError::from)?;
        active.received = received;
        self.state = DownloadState::InProgress;
        self.backoff.reset();

        let package_type = active.package_type;
        let percent = active.percent();
        let progressed = percent.is_some() && percent != active.last_percent;
        if progressed {
            active.last_percent = percent;
        }
        let checkpoint_due = active.received - active.last_checkpoint >= self.checkpoint_interval;

        if let (true, Some(percent)) = (progressed, percent) {
            self.events
                .borrow_mut()
                .handle_download_progress(package_type, percent);
        }
        if checkpoint_due {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Finishes the download with the package `signature` and verifies it.
    ///
    /// # Errors
    /// - [DownloadError::InvalidState] if no download is running or bytes are missing.
    /// - [DownloadError::Integrity] if verification fails, the download fails with an integrity
    ///   failure result.
    pub fn end_of_package(&mut self, signature: &[u8]) -> Result<(), DownloadError> {
        if !matches!(self.state, DownloadState::Started | DownloadState::InProgress) {
            return Err(DownloadError::InvalidState(self.state));
        }
        let Some(active) = self.active.as_ref() else {
            return Err(DownloadError::InvalidState(self.state));
        };
        if active.size > 0 && active.received < active.size {
            debug!(received = active.received, size = active.size, "end of package before all bytes");
            return Err(DownloadError::InvalidState(self.state));
        }
        let package_type = active.package_type;

        if let Err(e) = self.verifier.end(&self.credentials, package_type, signature) {
            self.fail(DownloadFailure::IntegrityFailure)?;
            return Err(e.into());
        }

        self.delete_checkpoint(package_type);
        self.persist(|update| match package_type {
            PackageType::Fw => {
                update.set_fw_update_state(FwUpdateState::Downloaded)?;
                update.set_fw_update_result(FwUpdateResult::Normal)
            },
            PackageType::Sw => {
                update.set_sw_update_state(SwUpdateState::Downloaded)?;
                update.set_sw_update_result(SwUpdateResult::Downloaded)
            },
        })?;
        self.state = DownloadState::Completed;
        info!(?package_type, "package download completed");
        self.events.borrow_mut().handle_download_complete(package_type);
        Ok(())
    }

    /// Aborts the download and discards all of its state.
    ///
    /// # Errors
    /// Returns [DownloadError::InvalidState] if nothing is left to abort.
    pub fn abort(&mut self) -> Result<(), DownloadError> {
        if matches!(self.state, DownloadState::Idle | DownloadState::Aborted) {
            return Err(DownloadError::InvalidState(self.state));
        }
        let Some(package_type) = self.active.as_ref().map(|a| a.package_type) else {
            return Err(DownloadError::InvalidState(self.state));
        };
        if self.state.is_active() {
            self.downloader.abort();
        }
        self.verifier.cancel();
        self.delete_checkpoint(package_type);
        self.state = DownloadState::Aborted;
        self.persist(|update| match package_type {
            PackageType::Fw => {
                update.set_fw_update_state(FwUpdateState::Idle)?;
                update.set_fw_update_result(FwUpdateResult::Normal)
            },
            PackageType::Sw => {
                update.set_sw_update_state(SwUpdateState::Initial)?;
                update.set_sw_update_result(SwUpdateResult::Initial)
            },
        })?;
        info!(?package_type, "package download aborted");
        self.events.borrow_mut().handle_download_aborted(package_type);
        Ok(())
    }

    /// Suspends a running download, checkpointing its progress.
    pub fn suspend(&mut self) -> Result<(), DownloadError> {
        if !matches!(self.state, DownloadState::Started | DownloadState::InProgress) {
            return Err(DownloadError::InvalidState(self.state));
        }
        self.downloader.abort();
        self.state = DownloadState::Suspended;
        self.checkpoint()?;
        info!(received = self.get_info().received, "package download suspended");
        Ok(())
    }

    pub fn get_info(&self) -> DownloadInfo {
        DownloadInfo {
            state: self.state,
            package_type: self.active.as_ref().map(|a| a.package_type),
            uri: self.active.as_ref().map(|a| a.uri.to_string()),
            received: self.active.as_ref().map_or(0, |a| a.received),
            size: self.active.as_ref().map_or(0, |a| a.size),
            progress: self.active.as_ref().and_then(|a| a.percent()),
        }
    }

    /// Schedules a retry of an interrupted download.
    ///
    /// A running download is suspended first. Requesting a retry while one is already scheduled
    /// keeps the scheduled one. Returns the time until the retry.
    pub fn request_retry(&mut self, timers: &mut Timers, now: Duration) -> Result<Duration, DownloadError> {
        match self.state {
            DownloadState::Started | DownloadState::InProgress => self.suspend()?,
            DownloadState::Suspended => {},
            state => return Err(DownloadError::InvalidState(state)),
        }
        if let Some(deadline) = timers.deadline(TimerId::DownloadRetry) {
            return Ok(deadline.saturating_sub(now));
        }
        let delay = self.backoff.next_delay();
        timers.arm_once(TimerId::DownloadRetry, now, delay);
        info!(delay_ms = delay.as_millis() as u64, "package download retry scheduled");
        Ok(delay)
    }

    /// Handles expiry of the retry timer by resuming the download where it stopped.
    pub fn on_retry_timer(&mut self) -> Result<(), DownloadError> {
        if self.state != DownloadState::Suspended {
            debug!(state = ?self.state, "ignoring retry timer");
            return Ok(());
        }
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        let (package_type, offset) = (active.package_type, active.received);
        self.downloader
            .resume(package_type, &active.uri, offset)
            .map_err(DownloadError::Downloader)?;
        self.state = DownloadState::InProgress;
        info!(?package_type, offset, "package download resumed");
        Ok(())
    }

    /// Records a download error reported by the downloader or the server.
    ///
    /// The failure result is persisted. The FW state stays `Downloaded` if every byte had been
    /// received and regresses to `Idle` otherwise.
    pub fn set_download_error(&mut self, failure: DownloadFailure) -> Result<(), DownloadError> {
        if self.state == DownloadState::Idle || self.active.is_none() {
            return Err(DownloadError::InvalidState(self.state));
        }
        if self.state.is_active() {
            self.downloader.abort();
        }
        self.fail(failure)
    }

    /// Records that the installation of the downloaded package was requested.
    pub fn set_update_accepted(&mut self, package_type: PackageType) -> Result<(), DownloadError> {
        let downloaded = match package_type {
            PackageType::Fw => self.update.fw_update_state() == FwUpdateState::Downloaded,
            PackageType::Sw => self.update.sw_update_state() == SwUpdateState::Downloaded,
        };
        if !downloaded {
            return Err(DownloadError::InvalidState(self.state));
        }
        self.persist(|update| match package_type {
            PackageType::Fw => update.set_fw_update_state(FwUpdateState::Updating),
            PackageType::Sw => update.set_sw_update_state(SwUpdateState::Delivered),
        })?;
        info!(?package_type, "package installation accepted");
        Ok(())
    }

    /// Records the outcome of the installation.
    pub fn set_update_result(&mut self, package_type: PackageType, success: bool) -> Result<(), DownloadError> {
        let installing = match package_type {
            PackageType::Fw => self.update.fw_update_state() == FwUpdateState::Updating,
            PackageType::Sw => self.update.sw_update_state() == SwUpdateState::Delivered,
        };
        if !installing {
            return Err(DownloadError::InvalidState(self.state));
        }
        self.persist(|update| match (package_type, success) {
            (PackageType::Fw, true) => {
                update.set_fw_update_result(FwUpdateResult::Success)?;
                update.set_fw_update_state(FwUpdateState::Idle)
            },
            (PackageType::Fw, false) => {
                update.set_fw_update_result(FwUpdateResult::UpdateFailed)?;
                update.set_fw_update_state(FwUpdateState::Idle)
            },
            (PackageType::Sw, true) => {
                update.set_sw_update_result(SwUpdateResult::Installed)?;
                update.set_sw_update_state(SwUpdateState::Installed)
            },
            (PackageType::Sw, false) => update.set_sw_update_result(SwUpdateResult::InstallFailure),
        })?;
        if self.state == DownloadState::Completed {
            self.state = if success {
                DownloadState::Installed
            } else {
                DownloadState::Failed
            };
        }
        info!(?package_type, success, "package installation finished");
        self.events.borrow_mut().handle_install_result(package_type, success);
        Ok(())
    }

    /// Returns whether a downloaded firmware waits for the install request.
    pub fn is_fw_install_waited(&self) -> bool {
        self.update.fw_update_state() == FwUpdateState::Downloaded
            && self.update.fw_update_result() == FwUpdateResult::Normal
    }

    /// Returns whether a firmware installation is in progress.
    pub fn is_fw_on_going(&self) -> bool {
        self.update.fw_update_state() == FwUpdateState::Updating
    }

    /// Persists the download offset together with the digest state.
    pub fn checkpoint(&mut self) -> Result<(), DownloadError> {
        if !self.state.is_active() {
            return Err(DownloadError::InvalidState(self.state));
        }
        let Some(active) = self.active.as_mut() else {
            return Err(DownloadError::InvalidState(self.state));
        };
        let digest = self.verifier.copy_out().map_err(crate::error::IntegrityError::from)?;
        let uri = active.uri.as_str().as_bytes();
        let mut record = Vec::with_capacity(CHECKPOINT_HEADER_LEN + uri.len());
        record.push(CHECKPOINT_VERSION);
        record.push(match active.package_type {
            PackageType::Fw => 0,
            PackageType::Sw => 1,
        });
        record.extend_from_slice(&active.received.to_le_bytes());
        record.extend_from_slice(&active.size.to_le_bytes());
        record.extend_from_slice(&digest);
        record.extend_from_slice(uri);

        let path = Self::checkpoint_path(active.package_type);
        self.storage.write(&path, &record).map_err(|source| {
            warn!(%path, error = %source, "unable to write download checkpoint");
            UpdateStoreError::Write {
                path: path.clone().into(),
                source,
            }
        })?;
        active.last_checkpoint = active.received;
        debug!(offset = active.received, "download checkpoint written");
        Ok(())
    }

    /// Restores an interrupted download from its checkpoint after a restart.
    ///
    /// The firmware checkpoint is preferred over the software one. On success, the download is
    /// `Suspended` and resumes once a retry is requested. Checkpoints that do not match the
    /// persisted update state are discarded. A package type persisted as downloading without a
    /// usable checkpoint is reset with a connection-lost result.
    pub fn resume_from_storage(&mut self) -> Result<Option<DownloadInfo>, DownloadError> {
        if self.state.is_active() {
            return Err(DownloadError::InvalidState(self.state));
        }
        for package_type in [PackageType::Fw, PackageType::Sw] {
            let downloading = match package_type {
                PackageType::Fw => self.update.fw_update_state() == FwUpdateState::Downloading,
                PackageType::Sw => self.update.sw_update_state() == SwUpdateState::DownloadStarted,
            };
            let path = Self::checkpoint_path(package_type);
            let record = self.storage.read(&path).unwrap_or_else(|e| {
                warn!(%path, error = %e, "unable to read download checkpoint");
                None
            });
            let restored = match record {
                Some(record) if downloading => self.restore_checkpoint(package_type, &record),
                Some(_) => {
                    warn!(%path, "discarding stale download checkpoint");
                    self.delete_checkpoint(package_type);
                    None
                },
                None => None,
            };
            if let Some(active) = restored {
                info!(?package_type, offset = active.received, "package download restored from checkpoint");
                self.active = Some(active);
                self.state = DownloadState::Suspended;
                return Ok(Some(self.get_info()));
            }
            if downloading {
                self.reset_interrupted(package_type)?;
            }
        }
        Ok(None)
    }

    fn restore_checkpoint(&mut self, package_type: PackageType, record: &[u8]) -> Option<ActiveDownload> {
        let path = Self::checkpoint_path(package_type);
        let Some((active, digest)) = parse_checkpoint(record, package_type) else {
            warn!(%path, "discarding malformed download checkpoint");
            self.delete_checkpoint(package_type);
            return None;
        };
        if self.verifier.is_active() {
            self.verifier.cancel();
        }
        if let Err(e) = self.verifier.restore(digest) {
            warn!(%path, error = %e, "discarding download checkpoint with invalid digest");
            self.delete_checkpoint(package_type);
            return None;
        }
        Some(active)
    }

    /// Resets a download that was interrupted before it could be resumed.
    fn reset_interrupted(&mut self, package_type: PackageType) -> Result<(), DownloadError> {
        warn!(?package_type, "interrupted download cannot be resumed, resetting update state");
        self.persist(|update| match package_type {
            PackageType::Fw => {
                update.set_fw_update_state(FwUpdateState::Idle)?;
                update.set_fw_update_result(FwUpdateResult::ConnectionLost)
            },
            PackageType::Sw => {
                update.set_sw_update_state(SwUpdateState::Initial)?;
                update.set_sw_update_result(SwUpdateResult::ConnectionLost)
            },
        })?;
        self.events
            .borrow_mut()
            .handle_download_failed(package_type, DownloadFailure::ConnectionLost);
        Ok(())
    }

    /// Moves to `Failed`, persisting the result for `failure`.
    fn fail(&mut self, failure: DownloadFailure) -> Result<(), DownloadError> {
        let Some(active) = self.active.as_ref() else {
            return Err(DownloadError::InvalidState(self.state));
        };
        let package_type = active.package_type;
        let keep_downloaded = self.state == DownloadState::Completed
            || (active.all_received() && failure != DownloadFailure::IntegrityFailure);
        self.verifier.cancel();
        self.delete_checkpoint(package_type);
        self.state = DownloadState::Failed;
        warn!(?package_type, ?failure, keep_downloaded, "package download failed");
        self.persist(|update| match package_type {
            PackageType::Fw => {
                update.set_fw_update_state(if keep_downloaded {
                    FwUpdateState::Downloaded
                } else {
                    FwUpdateState::Idle
                })?;
                update.set_fw_update_result(failure.fw_result())
            },
            PackageType::Sw => {
                update.set_sw_update_state(if keep_downloaded {
                    SwUpdateState::Downloaded
                } else {
                    SwUpdateState::Initial
                })?;
                update.set_sw_update_result(failure.sw_result())
            },
        })?;
        self.events.borrow_mut().handle_download_failed(package_type, failure);
        Ok(())
    }

    fn write_result(&mut self, package_type: PackageType, failure: DownloadFailure) -> Result<(), DownloadError> {
        let result = match package_type {
            PackageType::Fw => self.update.set_fw_update_result(failure.fw_result()),
            PackageType::Sw => self.update.set_sw_update_result(failure.sw_result()),
        };
        Ok(result?)
    }

    /// Runs a group of update-state writes. A failed write leaves the controller `Failed`.
    fn persist(
        &mut self,
        writes: impl FnOnce(&UpdateStateStore) -> Result<(), UpdateStoreError>,
    ) -> Result<(), DownloadError> {
        if let Err(e) = writes(&self.update) {
            if self.state.is_active() {
                self.downloader.abort();
            }
            self.verifier.cancel();
            self.state = DownloadState::Failed;
            return Err(e.into());
        }
        Ok(())
    }

    fn delete_checkpoint(&self, package_type: PackageType) {
        let path = Self::checkpoint_path(package_type);
        if let Err(e) = self.storage.delete(&path) {
            warn!(%path, error = %e, "unable to delete download checkpoint");
        }
    }
}

fn parse_checkpoint(record: &[u8], package_type: PackageType) -> Option<(ActiveDownload, &[u8])> {
    if record.len() <= CHECKPOINT_HEADER_LEN || record[0] != CHECKPOINT_VERSION {
        return None;
    }
    let stored_type = match record[1] {
        0 => PackageType::Fw,
        1 => PackageType::Sw,
        _ => return None,
    };
    if stored_type != package_type {
        return None;
    }
    let received = u64::from_le_bytes(record[2..10].try_into().ok()?);
    let size = u64::from_le_bytes(record[10..18].try_into().ok()?);
    let digest = &record[18..18 + SERIALIZED_LEN];
    let uri = Url::parse(std::str::from_utf8(&record[CHECKPOINT_HEADER_LEN..]).ok()?).ok()?;
    if size > 0 && received > size {
        return None;
    }
    let active = ActiveDownload {
        package_type,
        uri,
        size,
        received,
        last_percent: None,
        last_checkpoint: received,
    };
    Some((active, digest))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{credentials::MemoryStorage, error::Status, event::NoopEventHandler};

    #[derive(Debug, Default)]
    struct Calls {
        starts: Vec<String>,
        resumes: Vec<u64>,
        aborts: usize,
    }

    struct FakeDownloader(Rc<RefCell<Calls>>);

    impl PackageDownloader for FakeDownloader {
        fn start(&mut self, _package_type: PackageType, uri: &Url) -> Result<(), String> {
            self.0.borrow_mut().starts.push(uri.to_string());
            Ok(())
        }

        fn resume(&mut self, _package_type: PackageType, _uri: &Url, offset: u64) -> Result<(), String> {
            self.0.borrow_mut().resumes.push(offset);
            Ok(())
        }

        fn abort(&mut self) {
            self.0.borrow_mut().aborts += 1;
        }
    }

    fn controller() -> (Rc<MemoryStorage>, Rc<RefCell<Calls>>, DownloadController) {
        let storage = Rc::new(MemoryStorage::new());
        let calls = Rc::new(RefCell::new(Calls::default()));
        let controller = DownloadController::new(
            storage.clone(),
            Box::new(FakeDownloader(calls.clone())),
            Rc::new(RefCell::new(NoopEventHandler)),
        );
        (storage, calls, controller)
    }

    fn fw_request(size: u64) -> PackageRequest {
        PackageRequest {
            package_type: PackageType::Fw,
            uri: "https://dm.example/fw.bin".to_string(),
            size,
        }
    }

    #[test]
    fn invalid_uri_rejected() {
        let (_, calls, mut controller) = controller();
        let err = controller
            .start(PackageRequest {
                uri: "ftp://dm.example/fw.bin".to_string(),
                ..fw_request(10)
            })
            .unwrap_err();
        assert_eq!(<Status as From<&crate::error::DownloadError>>::from(&err), Status::InvalidArg);
        assert!(calls.borrow().starts.is_empty());
        assert_eq!(controller.update_store().fw_update_result(), FwUpdateResult::InvalidUri);
        assert_eq!(controller.state(), DownloadState::Idle);
    }

    #[test]
    fn abort_when_idle_is_invalid_state() {
        let (_, _, mut controller) = controller();
        let err = controller.abort().unwrap_err();
        assert_eq!(<Status as From<&crate::error::DownloadError>>::from(&err), Status::InvalidState);
    }

    #[test]
    fn receive_data_contracts() {
        let (_, _, mut controller) = controller();
        assert_eq!(
            <Status as From<&Result<(), crate::error::DownloadError>>>::from(&controller.receive_data(None)),
            Status::InvalidArg
        );
        controller.start(fw_request(4)).unwrap();
        controller.receive_data(Some(&[])).unwrap();
        assert_eq!(controller.state(), DownloadState::Started);
        controller.receive_data(Some(b"ab")).unwrap();
        assert_eq!(controller.get_info().progress, Some(50));
        let err = controller.receive_data(Some(b"cde")).unwrap_err();
        assert!(matches!(err, DownloadError::Oversized { received: 5, size: 4 }));
        assert_eq!(controller.state(), DownloadState::Failed);
        assert_eq!(
            controller.update_store().fw_update_result(),
            FwUpdateResult::IntegrityCheckFailure
        );
    }

    #[test]
    fn downloader_started_once_and_resumed_on_retry() {
        let (_, calls, mut controller) = controller();
        let mut timers = Timers::new();
        controller.start(fw_request(100)).unwrap();
        controller.receive_data(Some(&[0; 40])).unwrap();

        let first = controller.request_retry(&mut timers, Duration::ZERO).unwrap();
        let second = controller.request_retry(&mut timers, Duration::from_millis(100)).unwrap();
        assert!(second < first);
        assert_eq!(controller.state(), DownloadState::Suspended);

        assert_eq!(timers.expire(Duration::from_secs(2)), vec![TimerId::DownloadRetry]);
        controller.on_retry_timer().unwrap();
        assert_eq!(controller.state(), DownloadState::InProgress);

        let calls = calls.borrow();
        assert_eq!(calls.starts.len(), 1);
        assert_eq!(calls.resumes, vec![40]);
    }

    #[test]
    fn download_error_keeps_downloaded_when_complete() {
        let (_, _, mut controller) = controller();
        controller.start(fw_request(3)).unwrap();
        controller.receive_data(Some(b"abc")).unwrap();
        controller.set_download_error(DownloadFailure::ConnectionLost).unwrap();
        assert_eq!(controller.update_store().fw_update_state(), FwUpdateState::Downloaded);
        assert_eq!(controller.update_store().fw_update_result(), FwUpdateResult::ConnectionLost);

        controller.start(fw_request(3)).unwrap();
        controller.receive_data(Some(b"a")).unwrap();
        controller.set_download_error(DownloadFailure::ConnectionLost).unwrap();
        assert_eq!(controller.update_store().fw_update_state(), FwUpdateState::Idle);
    }

    #[test]
    fn storage_failure_is_fatal() {
        let (storage, _, mut controller) = controller();
        storage.set_fail_writes(true);
        let err = controller.start(fw_request(3)).unwrap_err();
        assert_eq!(<Status as From<&crate::error::DownloadError>>::from(&err), Status::Fatal);
        assert_eq!(controller.state(), DownloadState::Failed);
    }

    #[test]
    fn checkpoint_survives_restart() {
        let (storage, calls, mut controller) = controller();
        controller.start(fw_request(10)).unwrap();
        controller.receive_data(Some(b"01234")).unwrap();
        controller.checkpoint().unwrap();
        drop(controller);

        let mut restarted = DownloadController::new(
            storage.clone(),
            Box::new(FakeDownloader(calls.clone())),
            Rc::new(RefCell::new(NoopEventHandler)),
        );
        let info = restarted.resume_from_storage().unwrap().unwrap();
        assert_eq!(info.state, DownloadState::Suspended);
        assert_eq!(info.received, 5);
        assert_eq!(info.uri.as_deref(), Some("https://dm.example/fw.bin"));
    }

    #[test]
    fn stale_checkpoint_discarded() {
        let (storage, _, mut controller) = controller();
        storage.put_raw(&DownloadController::checkpoint_path(PackageType::Sw), &[1, 1, 0]);
        assert_eq!(controller.resume_from_storage().unwrap(), None);
        assert_eq!(
            storage.read(&DownloadController::checkpoint_path(PackageType::Sw)).unwrap(),
            None
        );
    }
}
