// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * tests/store_test.rs - Tests for the credential and update-state stores.
 */

use std::{fs, rc::Rc};

use avc_agent::{
    credentials::{
        pem::{PEM_FOOTER, PEM_HEADER},
        CredentialId, CredentialStore, FileSecureStorage, SecureStorage, SSL_CERTIFICATE_PATH,
    },
    error::{CredentialError, Status},
    integrity::PackageType,
    update::{FwUpdateResult, FwUpdateState, SwUpdateState, UpdateStateStore},
};
use tempfile::TempDir;

mod common;

fn file_storage() -> (TempDir, Rc<FileSecureStorage>) {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let storage = Rc::new(FileSecureStorage::new(dir.path()));
    (dir, storage)
}

#[test]
pub fn dm_address_round_trip() {
    let (_dir, storage) = file_storage();
    let credentials = CredentialStore::new(storage);
    credentials
        .set(CredentialId::DmAddress, b"coaps://dm.example:5684")
        .unwrap();
    assert_eq!(credentials.get(CredentialId::DmAddress).unwrap(), b"coaps://dm.example:5684");
}

#[test]
pub fn every_credential_round_trips() {
    let (dir, storage) = file_storage();
    let credentials = CredentialStore::new(storage.clone());
    for (index, id) in CredentialId::ALL.iter().enumerate() {
        let value = vec![index as u8 + 1; id.max_len()];
        assert!(!credentials.check(*id).unwrap());
        credentials.set(*id, &value).unwrap();
        assert!(credentials.check(*id).unwrap());

        // A fresh store on the same directory sees the value.
        let reopened = CredentialStore::new(Rc::new(FileSecureStorage::new(dir.path())));
        assert_eq!(reopened.get(*id).unwrap(), value);

        credentials.delete(*id).unwrap();
        credentials.delete(*id).unwrap();
        assert!(credentials.get(*id).unwrap().is_empty());
    }
}

#[test]
pub fn oversized_credential_rejected() {
    let (_dir, storage) = file_storage();
    let credentials = CredentialStore::new(storage);
    let result = credentials.set(CredentialId::DmSecretKey, &vec![0; CredentialId::DmSecretKey.max_len() + 1]);
    assert!(matches!(result, Err(CredentialError::TooLarge { .. })));
    assert_eq!(<Status as From<&Result<(), CredentialError>>>::from(&result), Status::InvalidArg);
}

#[test]
pub fn ssl_certificate_laid_out_as_pem() {
    let (_dir, storage) = file_storage();
    let credentials = CredentialStore::new(storage.clone());
    credentials.update_ssl_certificate("AAAA".repeat(16).as_bytes()).unwrap();

    let pem = storage.read(SSL_CERTIFICATE_PATH).unwrap().unwrap();
    let body = &pem[PEM_HEADER.len()..pem.len() - PEM_FOOTER.len()];
    assert!(pem.starts_with(PEM_HEADER.as_bytes()));
    assert!(pem.ends_with(PEM_FOOTER.as_bytes()));
    assert_eq!(body.len(), 65);
    assert_eq!(body.iter().position(|b| *b == b'\n'), Some(64));
    assert_eq!(body.iter().filter(|b| **b == b'\n').count(), 1);

    let result = credentials.update_ssl_certificate(&vec![b'A'; 4001]);
    assert_eq!(<Status as From<&Result<(), CredentialError>>>::from(&result), Status::IncorrectRange);

    credentials.update_ssl_certificate(b"").unwrap();
    assert!(credentials.ssl_certificate().unwrap().is_empty());
}

#[test]
pub fn update_state_survives_restart() {
    let (dir, storage) = file_storage();
    let store = UpdateStateStore::new(storage);
    store.set_fw_update_state(FwUpdateState::Downloading).unwrap();
    store.set_fw_update_result(FwUpdateResult::ConnectionLost).unwrap();
    store.set_sw_update_state(SwUpdateState::Delivered).unwrap();
    drop(store);

    let restarted = UpdateStateStore::new(Rc::new(FileSecureStorage::new(dir.path())));
    assert_eq!(restarted.fw_update_state(), FwUpdateState::Downloading);
    assert_eq!(restarted.fw_update_result(), FwUpdateResult::ConnectionLost);
    assert_eq!(restarted.sw_update_state(), SwUpdateState::Delivered);
}

#[test]
pub fn truncated_update_state_reads_default() {
    let (dir, storage) = file_storage();
    let store = UpdateStateStore::new(storage.clone());
    store.set_fw_update_state(FwUpdateState::Downloading).unwrap();

    let path = storage.resolve(&UpdateStateStore::path(PackageType::Fw, "updateState"));
    assert_eq!(fs::read(&path).unwrap(), 1u32.to_le_bytes());
    for len in (0..4).rev() {
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len).unwrap();
        assert_eq!(store.fw_update_state(), FwUpdateState::Idle, "truncated to {len} bytes");
    }

    fs::write(&path, 7u32.to_le_bytes()).unwrap();
    assert_eq!(store.fw_update_state(), FwUpdateState::Idle);

    // No temporary files are left next to the state.
    let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
    assert_eq!(leftovers, 1);
    drop(dir);
}
