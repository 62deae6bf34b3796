// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Private Storage Module
//!
//! Persistent state lives in an application-private directory owned by the
//! current user. Files are JSON (or raw bytes for secrets and keys) and are
//! replaced atomically: every write goes to a uniquely named temp file in
//! the same directory and is renamed over the target.
//!
//! ## Storage Layout
//!
//! ```text
//! <data dir>/
//!   permissions/
//!     {sha256(path)}.json        # PersistedPermission
//!   credentials/
//!     {sha256(repository_id)}.json  # CredentialRecord (no secret)
//!   secrets/                     # 0700, FileSecretStore backend
//!     {sha256(service)}/{sha256(account)}.secret
//!   keys/                        # 0700
//!     capability.key             # token signing key
//!   audit/
//!     {date}/events.jsonl        # Daily audit logs
//! ```
//!
//! ## Important Notes
//!
//! - Writers are single-process; no cross-process locking is done
//! - Secret values never land in `permissions/` or `credentials/`

pub mod audit;
pub mod paths;
pub mod private_fs;
pub mod repository;

pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use paths::StoragePaths;
pub use private_fs::{PrivateStorage, StorageError, StorageResult};
pub use repository::{
    CredentialRecord, CredentialRepository, PermissionRepository, PersistedPermission,
};
