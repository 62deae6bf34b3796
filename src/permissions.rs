// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Permission Store
//!
//! Persists capability tokens keyed by path so access granted in one run
//! survives a relaunch, and purges tokens that no longer resolve.
//!
//! ## Self-Healing
//!
//! Every failure path in [`PermissionStore::recover`] removes the entry
//! before reporting, so a corrupt or repointed token is re-requested on
//! next use instead of failing forever.
//!
//! ## Concurrency
//!
//! Operations on one path are serialized by a per-path async lock. Different
//! paths never wait on each other. A lock is dropped from the map once no
//! caller holds it.
//!
//! ## Paths
//!
//! Entries and locks are keyed by [`normalize_path`]. Consent, token and
//! refresh calls receive the caller's own path, and the persisted entry keeps
//! the path the grant was made for.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::capability::{normalize_path, CapabilityBroker, CapabilityToken};
use crate::error::{BrokerError, BrokerResult};
use crate::storage::{
    AuditEvent, AuditEventType, AuditLog, PermissionRepository, PersistedPermission,
    PrivateStorage, StorageError,
};

/// OS-level consent check performed before a token is requested.
#[async_trait]
pub trait ConsentGate: Send + Sync {
    /// Whether the user (or system policy) allows access to `path`.
    async fn request_consent(&self, path: &Path) -> bool;
}

/// Consent granted for any location that currently exists.
///
/// Used where consent is implied by the user having picked the location.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathExistsConsent;

#[async_trait]
impl ConsentGate for PathExistsConsent {
    async fn request_consent(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }
}

/// Outcome of [`PermissionStore::restore_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub purged: usize,
}

type PathLocks = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

/// Persists and recovers capability tokens.
pub struct PermissionStore {
    storage: Arc<PrivateStorage>,
    broker: Arc<CapabilityBroker>,
    consent: Arc<dyn ConsentGate>,
    audit: Arc<AuditLog>,
    locks: Mutex<PathLocks>,
}

impl PermissionStore {
    pub fn new(
        storage: Arc<PrivateStorage>,
        broker: Arc<CapabilityBroker>,
        consent: Arc<dyn ConsentGate>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            storage,
            broker,
            consent,
            audit,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn repo(&self) -> PermissionRepository<'_> {
        PermissionRepository::new(&self.storage)
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, PathLocks> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn path_lock(&self, key: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.lock_map().entry(key.to_path_buf()).or_default())
    }

    /// Forget `key`'s lock if `lock` is the last handle besides the map's.
    fn release_lock(&self, key: &Path, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.lock_map();
        if locks.get(key).is_some_and(|current| Arc::ptr_eq(current, &lock))
            && Arc::strong_count(&lock) == 2
        {
            locks.remove(key);
        }
    }

    /// Run `op` holding the per-path lock for `key`.
    async fn with_path_lock<T, F>(&self, key: &Path, op: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let lock = self.path_lock(key);
        let result = {
            let _guard = lock.lock().await;
            op.await
        };
        self.release_lock(key, lock);
        result
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.lock_map().len()
    }

    /// Ask for consent, create a token and persist it.
    ///
    /// Returns `false` when consent or the token is denied. Storage failures
    /// are `PersistenceFailed`.
    pub async fn request_and_persist(&self, path: &Path) -> BrokerResult<bool> {
        let key = normalize_path(path);
        self.with_path_lock(&key, self.grant(path)).await
    }

    async fn grant(&self, path: &Path) -> BrokerResult<bool> {
        if !self.consent.request_consent(path).await {
            info!(path = %path.display(), "Consent denied");
            self.audit_event(AuditEventType::PermissionDenied, path, Some("consent denied"));
            return Ok(false);
        }

        let token = match self.broker.create_token(path).await {
            Ok(token) => token,
            Err(e @ BrokerError::TokenCreationFailed { .. }) => {
                warn!(path = %path.display(), error = %e, "Capability token denied");
                self.audit_event(AuditEventType::PermissionDenied, path, Some(&e.to_string()));
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.repo()
            .save(&PersistedPermission::new(path.to_path_buf(), token))
            .map_err(|e| BrokerError::PersistenceFailed(e.to_string()))?;

        info!(path = %path.display(), "Permission granted and persisted");
        self.audit_event(AuditEventType::PermissionGranted, path, None);
        Ok(true)
    }

    /// Restore the persisted permission for `path`.
    ///
    /// Returns `false` (after removing the entry) when the token no longer
    /// resolves, resolves elsewhere, or is stale and cannot be refreshed.
    /// Unexpected failures remove the entry and surface as `RecoveryFailed`.
    pub async fn recover(&self, path: &Path) -> BrokerResult<bool> {
        Ok(self.recover_token(path).await?.is_some())
    }

    /// The recovered token for `path`, if a usable one is persisted.
    pub async fn valid_token(&self, path: &Path) -> BrokerResult<Option<CapabilityToken>> {
        self.recover_token(path).await
    }

    /// Non-failing probe; internal errors read as `false`.
    pub async fn has_valid_permission(&self, path: &Path) -> bool {
        match self.recover(path).await {
            Ok(valid) => valid,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Permission probe failed");
                false
            }
        }
    }

    /// Delete the persisted permission for `path`. A missing entry is fine.
    pub async fn revoke(&self, path: &Path) -> BrokerResult<()> {
        let key = normalize_path(path);
        self.with_path_lock(&key, async { self.remove(&key) }).await
    }

    fn remove(&self, key: &Path) -> BrokerResult<()> {
        match self.repo().delete(key) {
            Ok(existed) => {
                if existed {
                    info!(path = %key.display(), "Permission revoked");
                    self.audit_event(AuditEventType::PermissionRevoked, key, None);
                }
                Ok(())
            }
            Err(e) => {
                warn!(path = %key.display(), error = %e, "Failed to revoke permission");
                Err(BrokerError::RevocationFailed {
                    path: key.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Recover every persisted permission, purging the ones that fail.
    pub async fn restore_all(&self) -> BrokerResult<RestoreSummary> {
        let keys = self.repo().list_keys()?;
        let mut summary = RestoreSummary::default();

        for key in keys {
            let permission = match self.repo().get_by_key(&key) {
                Ok(permission) => permission,
                Err(e) => {
                    warn!(key = %key, error = %e, "Purging unreadable permission entry");
                    if let Err(e) = self.repo().delete_by_key(&key) {
                        warn!(key = %key, error = %e, "Failed to purge permission entry");
                    }
                    summary.purged += 1;
                    continue;
                }
            };

            match self.recover(&permission.path).await {
                Ok(true) => summary.restored += 1,
                Ok(false) => summary.purged += 1,
                Err(e) => {
                    warn!(path = %permission.path.display(), error = %e, "Permission recovery failed");
                    summary.purged += 1;
                }
            }
        }

        info!(
            restored = summary.restored,
            purged = summary.purged,
            "Restored persisted permissions"
        );
        Ok(summary)
    }

    /// Every path with a persisted permission.
    pub fn list(&self) -> BrokerResult<Vec<PathBuf>> {
        let repo = self.repo();
        let mut paths = Vec::new();
        for key in repo.list_keys()? {
            match repo.get_by_key(&key) {
                Ok(permission) => paths.push(permission.path),
                Err(e) => debug!(key = %key, error = %e, "Skipping unreadable permission entry"),
            }
        }
        paths.sort();
        Ok(paths)
    }

    // ========== Internals ==========

    async fn recover_token(&self, path: &Path) -> BrokerResult<Option<CapabilityToken>> {
        let key = normalize_path(path);
        self.with_path_lock(&key, self.recover_locked(&key)).await
    }

    async fn recover_locked(&self, key: &Path) -> BrokerResult<Option<CapabilityToken>> {
        let key = key.to_path_buf();
        let mut permission = match self.repo().get(&key) {
            Ok(permission) => permission,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(self.fail_recovery(&key, e.to_string())),
        };

        let resolution = match self.broker.resolve_token(&permission.token).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.purge(&key, &e.to_string());
                return Ok(None);
            }
        };

        if normalize_path(&resolution.path) != key {
            self.purge(
                &key,
                &format!("token resolves to {}", resolution.path.display()),
            );
            return Ok(None);
        }

        if resolution.is_stale {
            match self.broker.refresh_token(&permission.path).await {
                Ok(token) => permission.token = token,
                Err(e) => {
                    self.purge(&key, &e.to_string());
                    return Ok(None);
                }
            }
        }

        permission.last_validated_at = Utc::now();
        if let Err(e) = self.repo().save(&permission) {
            return Err(self.fail_recovery(&key, e.to_string()));
        }

        debug!(path = %key.display(), refreshed = resolution.is_stale, "Recovered permission");
        self.audit.record(
            AuditEvent::new(AuditEventType::PermissionRecovered)
                .with_resource("permission", key.display().to_string())
                .with_details(serde_json::json!({ "refreshed": resolution.is_stale })),
        );
        Ok(Some(permission.token))
    }

    /// Remove an entry that can no longer be used.
    fn purge(&self, key: &Path, reason: &str) {
        match self.repo().delete(key) {
            Ok(_) => info!(path = %key.display(), reason = %reason, "Purged stale permission"),
            Err(e) => warn!(path = %key.display(), error = %e, "Failed to purge permission"),
        }
        self.audit_event(AuditEventType::PermissionPurged, key, Some(reason));
    }

    /// Best-effort purge, then the error to surface.
    fn fail_recovery(&self, key: &Path, reason: String) -> BrokerError {
        self.purge(key, &reason);
        BrokerError::RecoveryFailed {
            path: key.to_path_buf(),
            reason,
        }
    }

    fn audit_event(&self, event_type: AuditEventType, key: &Path, error: Option<&str>) {
        let event =
            AuditEvent::new(event_type).with_resource("permission", key.display().to_string());
        self.audit.record(match error {
            Some(reason) => event.failed(reason),
            None => event,
        });
    }
}
