// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * update.rs - Persisted firmware/software update state.
 */

//! Update-state store.
//!
//! The state and result of the firmware (LwM2M object 5) and software (LwM2M object 9) update
//! are persisted in four independent files below `/avms/packageDownloader`, each holding one
//! little-endian `u32`. Reads never fail: a missing, truncated or unknown value yields the
//! default, so a torn write can never be observed as a garbage state.

use std::{fmt::Debug, rc::Rc};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tracing::{debug, warn};

use crate::{credentials::SecureStorage, error::UpdateStoreError, integrity::PackageType};

/// Directory of the persisted package download state.
pub const PACKAGE_DOWNLOADER_DIR: &str = "/avms/packageDownloader";

/// Firmware update state (LwM2M object 5, resource 3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, FromPrimitive)]
#[repr(u32)]
pub enum FwUpdateState {
    #[default]
    Idle = 0,
    Downloading = 1,
    Downloaded = 2,
    Updating = 3,
}

/// Firmware update result (LwM2M object 5, resource 5).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, FromPrimitive)]
#[repr(u32)]
pub enum FwUpdateResult {
    #[default]
    Normal = 0,
    Success = 1,
    NotEnoughSpace = 2,
    OutOfMemory = 3,
    ConnectionLost = 4,
    IntegrityCheckFailure = 5,
    UnsupportedPackageType = 6,
    InvalidUri = 7,
    UpdateFailed = 8,
    UnsupportedProtocol = 9,
}

/// Software update state (LwM2M object 9, resource 7).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, FromPrimitive)]
#[repr(u32)]
pub enum SwUpdateState {
    #[default]
    Initial = 0,
    DownloadStarted = 1,
    Downloaded = 2,
    Delivered = 3,
    Installed = 4,
}

/// Software update result (LwM2M object 9, resource 9).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, FromPrimitive)]
#[repr(u32)]
pub enum SwUpdateResult {
    #[default]
    Initial = 0,
    Downloading = 1,
    Installed = 2,
    Downloaded = 3,
    NotEnoughMemory = 50,
    OutOfMemory = 51,
    ConnectionLost = 52,
    CheckFailure = 53,
    UnsupportedType = 54,
    InvalidUri = 56,
    DeviceError = 57,
    InstallFailure = 58,
    UninstallFailure = 59,
}

/// A value persisted as a single little-endian `u32` file.
trait UpdateField: Copy + Debug + Default + FromPrimitive {
    const FILE: &'static str;

    fn to_raw(self) -> u32;
}

macro_rules! update_field {
    ($ty:ty, $file:literal) => {
        impl UpdateField for $ty {
            const FILE: &'static str = $file;

            fn to_raw(self) -> u32 {
                self as u32
            }
        }
    };
}

update_field!(FwUpdateState, "updateState");
update_field!(FwUpdateResult, "updateResult");
update_field!(SwUpdateState, "updateState");
update_field!(SwUpdateResult, "updateResult");

/// Reader and writer of the persisted update state.
#[derive(Clone)]
pub struct UpdateStateStore {
    storage: Rc<dyn SecureStorage>,
}

impl std::fmt::Debug for UpdateStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateStateStore").finish_non_exhaustive()
    }
}

impl UpdateStateStore {
    pub fn new(storage: Rc<dyn SecureStorage>) -> UpdateStateStore {
        UpdateStateStore { storage }
    }

    /// Storage path of `file` for `package_type`.
    pub fn path(package_type: PackageType, file: &str) -> String {
        format!("{PACKAGE_DOWNLOADER_DIR}/{}/{file}", package_type.dir_name())
    }

    fn read<T: UpdateField>(&self, package_type: PackageType) -> T {
        let path = Self::path(package_type, T::FILE);
        let bytes = match self.storage.read(&path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return T::default(),
            Err(e) => {
                warn!(%path, error = %e, "unable to read update state, using default");
                return T::default();
            },
        };
        let Ok(raw) = <[u8; 4]>::try_from(bytes.as_slice()) else {
            debug!(%path, len = bytes.len(), "update state file has wrong length, using default");
            return T::default();
        };
        T::from_u32(u32::from_le_bytes(raw)).unwrap_or_else(|| {
            debug!(%path, raw = u32::from_le_bytes(raw), "unknown update state value, using default");
            T::default()
        })
    }

    fn write<T: UpdateField>(&self, package_type: PackageType, value: T) -> Result<(), UpdateStoreError> {
        let path = Self::path(package_type, T::FILE);
        self.storage
            .write(&path, &value.to_raw().to_le_bytes())
            .map_err(|source| {
                warn!(%path, ?value, error = %source, "unable to persist update state");
                UpdateStoreError::Write {
                    path: path.clone().into(),
                    source,
                }
            })?;
        debug!(%path, ?value, "update state persisted");
        Ok(())
    }

    pub fn fw_update_state(&self) -> FwUpdateState {
        self.read(PackageType::Fw)
    }

    pub fn set_fw_update_state(&self, state: FwUpdateState) -> Result<(), UpdateStoreError> {
        self.write(PackageType::Fw, state)
    }

    pub fn fw_update_result(&self) -> FwUpdateResult {
        self.read(PackageType::Fw)
    }

    pub fn set_fw_update_result(&self, result: FwUpdateResult) -> Result<(), UpdateStoreError> {
        self.write(PackageType::Fw, result)
    }

    pub fn sw_update_state(&self) -> SwUpdateState {
        self.read(PackageType::Sw)
    }

    pub fn set_sw_update_state(&self, state: SwUpdateState) -> Result<(), UpdateStoreError> {
        self.write(PackageType::Sw, state)
    }

    pub fn sw_update_result(&self) -> SwUpdateResult {
        self.read(PackageType::Sw)
    }

    pub fn set_sw_update_result(&self, result: SwUpdateResult) -> Result<(), UpdateStoreError> {
        self.write(PackageType::Sw, result)
    }

    /// Removes the persisted state and result of `package_type`, which then read as defaults.
    pub fn clear(&self, package_type: PackageType) -> Result<(), UpdateStoreError> {
        for file in [FwUpdateState::FILE, FwUpdateResult::FILE] {
            let path = Self::path(package_type, file);
            self.storage.delete(&path).map_err(|source| UpdateStoreError::Remove {
                path: path.clone().into(),
                source,
            })?;
        }
        debug!(?package_type, "update state cleared");
        Ok(())
    }
}
