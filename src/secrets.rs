// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Secret vault over the OS secure store.
//!
//! Secrets are addressed by `(service, account)`. The vault maps the store's
//! error signals onto the broker taxonomy and never logs secret material.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::error::{BrokerError, BrokerResult};
use crate::platform::{SecretStore, SecretStoreError};

/// Secret payload. Zeroed on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// The payload as UTF-8, if it is.
    pub fn expose_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Stores small secrets keyed by `(service, account)`.
pub struct SecretVault {
    store: Arc<dyn SecretStore>,
}

impl SecretVault {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Add a new secret. Fails with `DuplicateSecret` if one exists.
    pub async fn add(&self, service: &str, account: &str, secret: &Secret) -> BrokerResult<()> {
        self.store
            .add(service, account, secret.expose())
            .await
            .map_err(map_store_error)?;
        debug!(service = %service, account = %account, "Secret added");
        Ok(())
    }

    pub async fn get(&self, service: &str, account: &str) -> BrokerResult<Secret> {
        let mut data = self
            .store
            .get(service, account)
            .await
            .map_err(map_store_error)?;
        let secret = Secret::new(data.clone());
        data.zeroize();
        Ok(secret)
    }

    /// Replace an existing secret in place.
    pub async fn update(&self, service: &str, account: &str, secret: &Secret) -> BrokerResult<()> {
        self.store
            .update(service, account, secret.expose())
            .await
            .map_err(map_store_error)?;
        debug!(service = %service, account = %account, "Secret updated");
        Ok(())
    }

    /// Write a secret whether or not one exists yet.
    ///
    /// Tries `add` first; an existing entry is updated in place.
    pub async fn upsert(&self, service: &str, account: &str, secret: &Secret) -> BrokerResult<()> {
        match self.add(service, account, secret).await {
            Err(BrokerError::DuplicateSecret) => self.update(service, account, secret).await,
            other => other,
        }
    }

    pub async fn delete(&self, service: &str, account: &str) -> BrokerResult<()> {
        self.store
            .delete(service, account)
            .await
            .map_err(map_store_error)?;
        debug!(service = %service, account = %account, "Secret deleted");
        Ok(())
    }
}

fn map_store_error(err: SecretStoreError) -> BrokerError {
    match err {
        SecretStoreError::Duplicate => BrokerError::DuplicateSecret,
        SecretStoreError::NotFound => BrokerError::SecretNotFound,
        SecretStoreError::Backend(reason) => {
            warn!(error = %reason, "Secret store failure");
            BrokerError::PersistenceFailed("secret store unavailable".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySecretStore;

    fn vault() -> (Arc<MemorySecretStore>, SecretVault) {
        let store = Arc::new(MemorySecretStore::new());
        (store.clone(), SecretVault::new(store))
    }

    #[test]
    fn debug_is_redacted() {
        let secret = Secret::from("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret([REDACTED])");
        assert_eq!(secret.expose_str(), Some("hunter2"));
    }

    #[tokio::test]
    async fn add_get_delete() {
        let (_, vault) = vault();
        vault.add("svc", "repo-1", &Secret::from("pw")).await.unwrap();

        let secret = vault.get("svc", "repo-1").await.unwrap();
        assert_eq!(secret.expose(), b"pw");

        vault.delete("svc", "repo-1").await.unwrap();
        assert!(matches!(
            vault.get("svc", "repo-1").await,
            Err(BrokerError::SecretNotFound)
        ));
    }

    #[tokio::test]
    async fn duplicate_and_missing_are_distinct() {
        let (_, vault) = vault();
        vault.add("svc", "a", &Secret::from("1")).await.unwrap();

        assert!(matches!(
            vault.add("svc", "a", &Secret::from("2")).await,
            Err(BrokerError::DuplicateSecret)
        ));
        assert!(matches!(
            vault.update("svc", "b", &Secret::from("2")).await,
            Err(BrokerError::SecretNotFound)
        ));
    }

    #[tokio::test]
    async fn upsert_updates_in_place() {
        let (store, vault) = vault();
        vault.upsert("svc", "a", &Secret::from("1")).await.unwrap();
        vault.upsert("svc", "a", &Secret::from("2")).await.unwrap();

        assert_eq!(vault.get("svc", "a").await.unwrap().expose(), b"2");
        assert_eq!(store.updates.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(store.deletes.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn backend_failure_hides_detail() {
        let (store, vault) = vault();
        store.fail_writes(true);

        let err = vault.add("svc", "a", &Secret::from("1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::PersistenceFailed(ref m) if !m.contains("injected")));
    }
}
