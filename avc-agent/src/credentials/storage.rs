// SPDX-License-Identifier: BSD-2-Clause
/*
 * Copyright © The avc-agent Contributors, all rights reserved.
 * This file is part of the avc-agent project, see the README file for
 * general information on this project and the NOTICE.md and LICENSE files
 * for information regarding copyright ownership and terms of use.
 *
 * credentials/storage.rs - Persistent, path-addressed storage.
 */

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tracing::trace;

/// Path-addressed persistent storage used for credentials, update state and download
/// checkpoints.
///
/// Paths are absolute, slash separated strings such as `/avms/FW_KEY`.
pub trait SecureStorage {
    /// Reads the file at `path`, returning `None` if it does not exist.
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replaces the content of `path` atomically. The data is durable once this returns.
    fn write(&self, path: &str, data: &[u8]) -> io::Result<()>;

    /// Removes `path`. Removing a file that does not exist succeeds.
    fn delete(&self, path: &str) -> io::Result<()>;
}

/// Storage backed by a directory of the local file system.
///
/// Writes go to a temporary file in the target directory, which is synced and then renamed over
/// the target, so readers observe either the old or the new content.
#[derive(Debug, Clone)]
pub struct FileSecureStorage {
    root: PathBuf,
}

impl FileSecureStorage {
    pub fn new(root: impl Into<PathBuf>) -> FileSecureStorage {
        FileSecureStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a storage path to a file below the root directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl SecureStorage for FileSecureStorage {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let target = self.resolve(path);
        let dir = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "storage path has no parent"))?;
        fs::create_dir_all(dir)?;
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(data)?;
        file.as_file().sync_all()?;
        file.persist(&target).map_err(|e| e.error)?;
        // Make the rename itself durable. Directories cannot be opened for syncing everywhere.
        if let Ok(dir) = fs::File::open(dir) {
            let _ = dir.sync_all();
        }
        trace!(path, len = data.len(), "storage file written");
        Ok(())
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Storage held in memory, with optional write failure injection.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RefCell<HashMap<String, Vec<u8>>>,
    fail_writes: Cell<bool>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    /// Makes every subsequent write and delete fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Replaces a file without going through the atomic write path, e.g. to simulate a torn
    /// write.
    pub fn put_raw(&self, path: &str, data: &[u8]) {
        self.files.borrow_mut().insert(path.to_string(), data.to_vec());
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.fail_writes.get() {
            return Err(io::Error::new(io::ErrorKind::Other, "injected storage failure"));
        }
        Ok(())
    }
}

impl SecureStorage for MemoryStorage {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.files.borrow().get(path).cloned())
    }

    fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        self.check_writable()?;
        self.put_raw(path, data);
        Ok(())
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        self.check_writable()?;
        self.files.borrow_mut().remove(path);
        Ok(())
    }
}
