// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Capability API backed by signed tokens.
//!
//! ## Token Format
//!
//! ```text
//! [ JSON payload ][ HMAC-SHA256 tag (32 bytes) ]
//! payload = { version, path, file_id, read_only, issued_at }
//! ```
//!
//! The tag is keyed by a per-installation key stored in `keys/capability.key`.
//! A token that fails tag verification or does not parse is corrupt. A token
//! whose recorded file identity (device, inode) no longer matches the file at
//! its path is stale: the location was replaced and the token must be
//! re-derived.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use super::{CapabilityApi, PlatformError, Resolution};
use crate::storage::{PrivateStorage, StorageError};

type HmacSha256 = Hmac<Sha256>;

/// Current token payload version.
const TOKEN_VERSION: u8 = 1;

/// Length of the trailing HMAC-SHA256 tag.
const TAG_LEN: usize = 32;

/// Length of the signing key.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FileId {
    dev: u64,
    ino: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    version: u8,
    path: PathBuf,
    file_id: Option<FileId>,
    read_only: bool,
    issued_at: DateTime<Utc>,
}

/// Capability API issuing HMAC-signed tokens.
pub struct LocalCapabilityApi {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for LocalCapabilityApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCapabilityApi").finish_non_exhaustive()
    }
}

impl LocalCapabilityApi {
    /// Create with an explicit signing key.
    pub fn with_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Load the installation key from storage, generating it on first use.
    pub fn open(storage: &PrivateStorage) -> Result<Self, PlatformError> {
        let path = storage.paths().capability_key();
        match storage.read_raw(&path) {
            Ok(bytes) => {
                let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
                    PlatformError::Corrupt(format!(
                        "capability key has {} bytes, expected {KEY_LEN}",
                        bytes.len()
                    ))
                })?;
                Ok(Self::with_key(key))
            }
            Err(StorageError::NotFound(_)) => {
                let mut key = [0u8; KEY_LEN];
                SystemRandom::new()
                    .fill(&mut key)
                    .map_err(|_| PlatformError::Denied("system RNG unavailable".to_string()))?;
                storage
                    .write_raw(&path, &key)
                    .map_err(|e| PlatformError::Denied(format!("cannot persist key: {e}")))?;
                debug!("Generated capability signing key");
                Ok(Self::with_key(key))
            }
            Err(e) => Err(PlatformError::Denied(format!("cannot read key: {e}"))),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length")
    }
}

#[async_trait]
impl CapabilityApi for LocalCapabilityApi {
    async fn create_token(&self, path: &Path, read_only: bool) -> Result<Vec<u8>, PlatformError> {
        if !path.is_absolute() {
            return Err(PlatformError::InvalidPath(format!(
                "{} is not absolute",
                path.display()
            )));
        }

        let metadata = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PlatformError::InvalidPath(format!("{} does not exist", path.display()))
            }
            std::io::ErrorKind::PermissionDenied => {
                PlatformError::Denied(format!("{} is not accessible", path.display()))
            }
            _ => PlatformError::Io(e),
        })?;

        let payload = TokenPayload {
            version: TOKEN_VERSION,
            path: path.to_path_buf(),
            file_id: file_id(&metadata),
            read_only,
            issued_at: Utc::now(),
        };

        let mut bytes = serde_json::to_vec(&payload)
            .map_err(|e| PlatformError::Corrupt(format!("payload encoding: {e}")))?;
        let mut mac = self.mac();
        mac.update(&bytes);
        bytes.extend_from_slice(&mac.finalize().into_bytes());
        Ok(bytes)
    }

    async fn resolve(&self, token: &[u8]) -> Result<Resolution, PlatformError> {
        if token.len() <= TAG_LEN {
            return Err(PlatformError::Corrupt("token too short".to_string()));
        }

        let (payload_bytes, tag) = token.split_at(token.len() - TAG_LEN);
        let mut mac = self.mac();
        mac.update(payload_bytes);
        mac.verify_slice(tag)
            .map_err(|_| PlatformError::Corrupt("signature mismatch".to_string()))?;

        let payload: TokenPayload = serde_json::from_slice(payload_bytes)
            .map_err(|e| PlatformError::Corrupt(format!("payload decoding: {e}")))?;
        if payload.version != TOKEN_VERSION {
            return Err(PlatformError::Corrupt(format!(
                "unsupported token version {}",
                payload.version
            )));
        }

        let metadata = match tokio::fs::metadata(&payload.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PlatformError::NotFound(payload.path.display().to_string()));
            }
            Err(e) => return Err(PlatformError::Io(e)),
        };

        let is_stale = match (payload.file_id, file_id(&metadata)) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => false,
        };

        Ok(Resolution {
            path: payload.path,
            is_stale,
        })
    }

    async fn begin_access(&self, path: &Path) -> bool {
        let granted = tokio::fs::metadata(path).await.is_ok();
        debug!(path = %path.display(), granted, "begin access");
        granted
    }

    async fn end_access(&self, path: &Path) {
        debug!(path = %path.display(), "end access");
    }
}

#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;

    Some(FileId {
        dev: metadata.dev(),
        ino: metadata.ino(),
    })
}

#[cfg(not(unix))]
fn file_id(_metadata: &std::fs::Metadata) -> Option<FileId> {
    None
}
