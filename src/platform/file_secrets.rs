// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Secret store backed by owner-only files in the private data directory.
//!
//! Each `(service, account)` item is one file whose name is derived from
//! hashes of both parts, so the directory listing reveals neither.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{SecretStore, SecretStoreError};
use crate::storage::{PrivateStorage, StorageError};

/// File-backed implementation of [`SecretStore`].
pub struct FileSecretStore {
    storage: Arc<PrivateStorage>,
    // Serializes check-then-write sequences of add/update.
    write_lock: Mutex<()>,
}

impl FileSecretStore {
    /// Create a new store over the given storage.
    pub fn new(storage: Arc<PrivateStorage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn backend(e: StorageError) -> SecretStoreError {
    match e {
        StorageError::NotFound(_) => SecretStoreError::NotFound,
        other => SecretStoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn add(&self, service: &str, account: &str, data: &[u8]) -> Result<(), SecretStoreError> {
        let path = self.storage.paths().secret(service, account);
        let _guard = self.lock();
        if self.storage.exists(&path) {
            return Err(SecretStoreError::Duplicate);
        }
        self.storage.write_raw(&path, data).map_err(backend)
    }

    async fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, SecretStoreError> {
        let path = self.storage.paths().secret(service, account);
        self.storage.read_raw(&path).map_err(backend)
    }

    async fn update(
        &self,
        service: &str,
        account: &str,
        data: &[u8],
    ) -> Result<(), SecretStoreError> {
        let path = self.storage.paths().secret(service, account);
        let _guard = self.lock();
        if !self.storage.exists(&path) {
            return Err(SecretStoreError::NotFound);
        }
        self.storage.write_raw(&path, data).map_err(backend)
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        let path = self.storage.paths().secret(service, account);
        let _guard = self.lock();
        self.storage.delete(&path).map_err(backend)
    }
}
