// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Platform Contracts
//!
//! The broker consumes two OS facilities it does not own:
//!
//! - a **capability API** issuing opaque tokens for filesystem locations and
//!   opening/closing access windows on them, and
//! - a **secure secret store** keyed by `(service, account)`.
//!
//! Both are traits so every component can be constructed with a fake in
//! tests. `LocalCapabilityApi` and `FileSecretStore` are the shipped
//! implementations backed by the private data directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

pub mod file_secrets;
pub mod local;

pub use file_secrets::FileSecretStore;
pub use local::LocalCapabilityApi;

/// Errors reported by the OS capability API.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("access denied: {0}")]
    Denied(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("corrupt token: {0}")]
    Corrupt(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of resolving a capability token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Location the token currently refers to.
    pub path: PathBuf,
    /// The OS considers the token stale and it should be refreshed.
    pub is_stale: bool,
}

/// OS capability API (security-scoped bookmarks or equivalent).
#[async_trait]
pub trait CapabilityApi: Send + Sync {
    /// Create an opaque token for `path`.
    async fn create_token(&self, path: &Path, read_only: bool) -> Result<Vec<u8>, PlatformError>;

    /// Resolve a token back to a location.
    async fn resolve(&self, token: &[u8]) -> Result<Resolution, PlatformError>;

    /// Open an access window on `path`. Returns whether access was granted.
    async fn begin_access(&self, path: &Path) -> bool;

    /// Close an access window on `path`.
    async fn end_access(&self, path: &Path);
}

/// Errors reported by the secure secret store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretStoreError {
    #[error("an item already exists for this service and account")]
    Duplicate,

    #[error("no item exists for this service and account")]
    NotFound,

    #[error("secret store failure: {0}")]
    Backend(String),
}

/// OS secure secret store (keychain or equivalent).
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Add a new item. Fails with `Duplicate` if one exists.
    async fn add(&self, service: &str, account: &str, data: &[u8]) -> Result<(), SecretStoreError>;

    /// Read an item.
    async fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, SecretStoreError>;

    /// Replace an existing item in place. Fails with `NotFound` if absent.
    async fn update(
        &self,
        service: &str,
        account: &str,
        data: &[u8],
    ) -> Result<(), SecretStoreError>;

    /// Delete an item. Fails with `NotFound` if absent.
    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}
