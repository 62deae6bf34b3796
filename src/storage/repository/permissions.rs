// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted capability tokens.
//!
//! One JSON file per protected path under `permissions/`, named by the
//! SHA-256 of the normalized path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::super::paths::hashed_key;
use super::super::{PrivateStorage, StorageError, StorageResult};
use crate::capability::{normalize_path, CapabilityToken};

/// A capability token persisted for a path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedPermission {
    /// Path the token was issued for, as the caller spelled it
    pub path: PathBuf,
    /// Token blob (base64 on disk)
    pub token: CapabilityToken,
    /// When the token was first created
    pub created_at: DateTime<Utc>,
    /// When the token last resolved cleanly
    pub last_validated_at: DateTime<Utc>,
}

impl PersistedPermission {
    pub fn new(path: PathBuf, token: CapabilityToken) -> Self {
        let now = Utc::now();
        Self {
            path,
            token,
            created_at: now,
            last_validated_at: now,
        }
    }
}

/// Repository for persisted permissions.
pub struct PermissionRepository<'a> {
    storage: &'a PrivateStorage,
}

impl<'a> PermissionRepository<'a> {
    pub fn new(storage: &'a PrivateStorage) -> Self {
        Self { storage }
    }

    fn file_for(&self, path: &Path) -> PathBuf {
        let key = normalize_path(path);
        self.storage
            .paths()
            .permission(&hashed_key(&key.to_string_lossy()))
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.storage.exists(self.file_for(path))
    }

    pub fn get(&self, path: &Path) -> StorageResult<PersistedPermission> {
        let file = self.file_for(path);
        if !self.storage.exists(&file) {
            return Err(StorageError::NotFound(format!(
                "Permission {}",
                path.display()
            )));
        }
        self.storage.read_json(file)
    }

    /// Create or replace the entry for `permission.path`.
    pub fn save(&self, permission: &PersistedPermission) -> StorageResult<()> {
        self.storage
            .write_json(self.file_for(&permission.path), permission)
    }

    /// Delete the entry for `path`. Returns whether one existed.
    pub fn delete(&self, path: &Path) -> StorageResult<bool> {
        match self.storage.delete(self.file_for(path)) {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Storage keys of every persisted entry.
    pub fn list_keys(&self) -> StorageResult<Vec<String>> {
        self.storage
            .list_files(self.storage.paths().permissions_dir(), "json")
    }

    /// Read an entry by storage key.
    pub fn get_by_key(&self, key: &str) -> StorageResult<PersistedPermission> {
        self.storage.read_json(self.storage.paths().permission(key))
    }

    /// Delete an entry by storage key.
    pub fn delete_by_key(&self, key: &str) -> StorageResult<()> {
        self.storage.delete(self.storage.paths().permission(key))
    }
}
