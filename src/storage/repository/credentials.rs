// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Credential metadata repository.
//!
//! Records carry no secret material. Files are named by the SHA-256 of the
//! repository id so arbitrary ids map to safe file names.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::super::paths::hashed_key;
use super::super::{PrivateStorage, StorageError, StorageResult};

/// Metadata describing a repository credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialRecord {
    pub repository_id: String,
    pub repository_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file_name: Option<String>,
}

impl CredentialRecord {
    pub fn new(repository_id: impl Into<String>, repository_path: impl Into<PathBuf>) -> Self {
        Self {
            repository_id: repository_id.into(),
            repository_path: repository_path.into(),
            key_file_name: None,
        }
    }

    pub fn with_key_file(mut self, name: impl Into<String>) -> Self {
        self.key_file_name = Some(name.into());
        self
    }
}

/// Repository for credential metadata.
pub struct CredentialRepository<'a> {
    storage: &'a PrivateStorage,
}

impl<'a> CredentialRepository<'a> {
    pub fn new(storage: &'a PrivateStorage) -> Self {
        Self { storage }
    }

    fn file_for(&self, repository_id: &str) -> PathBuf {
        self.storage.paths().credential(&hashed_key(repository_id))
    }

    pub fn exists(&self, repository_id: &str) -> bool {
        self.storage.exists(self.file_for(repository_id))
    }

    pub fn get(&self, repository_id: &str) -> StorageResult<CredentialRecord> {
        let file = self.file_for(repository_id);
        if !self.storage.exists(&file) {
            return Err(StorageError::NotFound(format!(
                "Credential {repository_id}"
            )));
        }
        self.storage.read_json(file)
    }

    /// Create or replace a record.
    pub fn save(&self, record: &CredentialRecord) -> StorageResult<()> {
        self.storage
            .write_json(self.file_for(&record.repository_id), record)
    }

    pub fn delete(&self, repository_id: &str) -> StorageResult<()> {
        if !self.exists(repository_id) {
            return Err(StorageError::NotFound(format!(
                "Credential {repository_id}"
            )));
        }
        self.storage.delete(self.file_for(repository_id))
    }

    /// All records, sorted by repository id. Unreadable files are skipped.
    pub fn list(&self) -> StorageResult<Vec<CredentialRecord>> {
        let keys = self
            .storage
            .list_files(self.storage.paths().credentials_dir(), "json")?;

        let mut records = Vec::new();
        for key in keys {
            match self
                .storage
                .read_json::<CredentialRecord>(self.storage.paths().credential(&key))
            {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable credential record"),
            }
        }
        records.sort_by(|a, b| a.repository_id.cmp(&b.repository_id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoragePaths;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PrivateStorage) {
        let dir = TempDir::new().unwrap();
        let mut storage = PrivateStorage::new(StoragePaths::new(dir.path()));
        storage.initialize().unwrap();
        (dir, storage)
    }

    #[test]
    fn crud() {
        let (_dir, storage) = setup();
        let repo = CredentialRepository::new(&storage);
        let record = CredentialRecord::new("repo/../1", "/Volumes/Backup").with_key_file("key.txt");

        repo.save(&record).unwrap();
        assert_eq!(repo.get("repo/../1").unwrap(), record);

        repo.delete("repo/../1").unwrap();
        assert!(matches!(repo.delete("repo/../1"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn list_is_sorted_and_skips_garbage() {
        let (_dir, storage) = setup();
        let repo = CredentialRepository::new(&storage);
        repo.save(&CredentialRecord::new("b", "/b")).unwrap();
        repo.save(&CredentialRecord::new("a", "/a")).unwrap();
        storage
            .write_raw(storage.paths().credential("garbage"), b"{not json")
            .unwrap();

        let ids: Vec<_> = repo.list().unwrap().into_iter().map(|r| r.repository_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn key_file_is_optional_on_disk() {
        let (_dir, storage) = setup();
        let repo = CredentialRepository::new(&storage);
        storage
            .write_raw(
                storage.paths().credential(&hashed_key("r")),
                br#"{"repository_id":"r","repository_path":"/r"}"#,
            )
            .unwrap();
        assert_eq!(repo.get("r").unwrap().key_file_name, None);
    }
}
