// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Repository layer providing typed access to private storage.
//!
//! Each repository provides CRUD operations for a specific entity type,
//! using `PrivateStorage` for all file operations.

pub mod credentials;
pub mod permissions;

pub use credentials::{CredentialRecord, CredentialRepository};
pub use permissions::{PermissionRepository, PersistedPermission};
