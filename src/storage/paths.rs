// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path constants and utilities for the private storage layout.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Directory name used under the platform data directory.
pub const APP_DIR_NAME: &str = "sandbox-broker";

/// Fallback root when no home directory can be determined.
pub const FALLBACK_ROOT: &str = "/var/lib/sandbox-broker";

/// Storage path utilities for the application-private directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        match std::env::var_os("HOME") {
            Some(home) => Self::new(
                PathBuf::from(home)
                    .join(".local")
                    .join("share")
                    .join(APP_DIR_NAME),
            ),
            None => Self::new(FALLBACK_ROOT),
        }
    }
}

impl StoragePaths {
    /// Create a new StoragePaths with a custom root (useful for testing).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory for all private data.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========== Permission Paths ==========

    /// Directory containing all persisted capability tokens.
    pub fn permissions_dir(&self) -> PathBuf {
        self.root.join("permissions")
    }

    /// Path to the persisted permission for a storage key.
    pub fn permission(&self, key: &str) -> PathBuf {
        self.permissions_dir().join(format!("{key}.json"))
    }

    // ========== Credential Paths ==========

    /// Directory containing credential metadata records.
    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join("credentials")
    }

    /// Path to a credential metadata record.
    pub fn credential(&self, repository_id: &str) -> PathBuf {
        self.credentials_dir().join(format!("{repository_id}.json"))
    }

    // ========== Secret Paths ==========

    /// Directory containing file-backed secrets.
    pub fn secrets_dir(&self) -> PathBuf {
        self.root.join("secrets")
    }

    /// Path to the secret for a (service, account) pair.
    ///
    /// Both parts are hashed so arbitrary strings map to safe file names.
    pub fn secret(&self, service: &str, account: &str) -> PathBuf {
        self.secrets_dir()
            .join(hashed_key(service))
            .join(format!("{}.secret", hashed_key(account)))
    }

    // ========== Key Paths ==========

    /// Directory containing installation keys.
    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    /// Path to the capability token signing key.
    pub fn capability_key(&self) -> PathBuf {
        self.keys_dir().join("capability.key")
    }

    // ========== Audit Log Paths ==========

    /// Directory containing audit logs.
    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    /// Directory for a specific date's audit logs.
    pub fn audit_date_dir(&self, date: &str) -> PathBuf {
        self.audit_dir().join(date)
    }

    /// Path to a daily audit events file (JSONL format).
    pub fn audit_events_file(&self, date: &str) -> PathBuf {
        self.audit_date_dir(date).join("events.jsonl")
    }
}

/// Hex-encoded SHA-256 of `value`, used as a filesystem-safe key.
pub fn hashed_key(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root_for_testing() {
        let paths = StoragePaths::new("/tmp/test-data");
        assert_eq!(paths.root(), Path::new("/tmp/test-data"));
        assert_eq!(
            paths.credential("repo-123"),
            PathBuf::from("/tmp/test-data/credentials/repo-123.json")
        );
    }

    #[test]
    fn permission_paths_are_correct() {
        let paths = StoragePaths::new("/data");
        assert_eq!(paths.permissions_dir(), PathBuf::from("/data/permissions"));
        assert_eq!(
            paths.permission("abc"),
            PathBuf::from("/data/permissions/abc.json")
        );
    }

    #[test]
    fn secret_paths_hide_identifiers() {
        let paths = StoragePaths::new("/data");
        let path = paths.secret("backup.repository", "repo-1");
        let rendered = path.to_string_lossy();
        assert!(rendered.starts_with("/data/secrets/"));
        assert!(rendered.ends_with(".secret"));
        assert!(!rendered.contains("repo-1"));
        assert!(!rendered.contains("backup.repository"));
    }

    #[test]
    fn audit_paths_are_correct() {
        let paths = StoragePaths::new("/data");
        assert_eq!(paths.audit_dir(), PathBuf::from("/data/audit"));
        assert_eq!(
            paths.audit_events_file("2026-01-28"),
            PathBuf::from("/data/audit/2026-01-28/events.jsonl")
        );
    }

    #[test]
    fn hashed_key_is_stable_hex() {
        let key = hashed_key("/Users/alice/Documents");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, hashed_key("/Users/alice/Documents"));
        assert_ne!(key, hashed_key("/Users/alice/Desktop"));
    }
}
