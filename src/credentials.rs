// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Credential Vault
//!
//! Pairs repository metadata (stored as plain JSON records) with the
//! repository password (stored in the [`SecretVault`]). The two halves are
//! written and read independently and recombined only in a transient
//! [`Credential`] value that is never persisted.
//!
//! ## Write Ordering
//!
//! `store` writes the secret before the metadata. A failure between the two
//! leaves an orphaned secret, which a retry overwrites. The reverse order
//! could leave metadata pointing at a secret that does not exist.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::secrets::{Secret, SecretVault};
use crate::storage::{
    AuditEvent, AuditEventType, AuditLog, CredentialRecord, CredentialRepository, PrivateStorage,
    StorageError,
};

/// Default secret-store service name.
pub const DEFAULT_SECRET_SERVICE: &str = "sandbox-broker.repository";

/// A credential record joined with its secret. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub record: CredentialRecord,
    pub secret: Secret,
}

/// Stores repository credentials as metadata plus secret.
pub struct CredentialVault {
    storage: Arc<PrivateStorage>,
    secrets: SecretVault,
    service: String,
    audit: Arc<AuditLog>,
}

impl CredentialVault {
    pub fn new(
        storage: Arc<PrivateStorage>,
        secrets: SecretVault,
        service: impl Into<String>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            storage,
            secrets,
            service: service.into(),
            audit,
        }
    }

    fn records(&self) -> CredentialRepository<'_> {
        CredentialRepository::new(&self.storage)
    }

    /// Store a new credential, secret first.
    pub async fn store(&self, record: &CredentialRecord, secret: &Secret) -> BrokerResult<()> {
        let id = &record.repository_id;
        // A retry after a failed metadata write finds the orphaned secret.
        self.secrets.upsert(&self.service, id, secret).await?;

        if let Err(e) = self.records().save(record) {
            warn!(repository_id = %id, error = %e, "Credential metadata write failed after secret write");
            return Err(e.into());
        }

        info!(repository_id = %id, "Credential stored");
        self.audit.record(
            AuditEvent::new(AuditEventType::CredentialStored).with_resource("credential", id.as_str()),
        );
        Ok(())
    }

    /// Load a credential and its secret.
    pub async fn retrieve(&self, repository_id: &str) -> BrokerResult<Credential> {
        let record = self.load_record(repository_id)?;
        let secret = self.secrets.get(&self.service, repository_id).await?;
        Ok(Credential { record, secret })
    }

    /// Update metadata, and the secret in place when one is given.
    pub async fn update(
        &self,
        record: &CredentialRecord,
        new_secret: Option<&Secret>,
    ) -> BrokerResult<()> {
        let id = &record.repository_id;
        self.records().save(record)?;

        if let Some(secret) = new_secret {
            match self.secrets.update(&self.service, id, secret).await {
                Ok(()) => {}
                Err(BrokerError::SecretNotFound) => {
                    warn!(repository_id = %id, "Secret missing during update; adding it");
                    self.secrets.add(&self.service, id, secret).await?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(repository_id = %id, secret_changed = new_secret.is_some(), "Credential updated");
        self.audit.record(
            AuditEvent::new(AuditEventType::CredentialUpdated)
                .with_resource("credential", id.as_str())
                .with_details(serde_json::json!({ "secret_changed": new_secret.is_some() })),
        );
        Ok(())
    }

    /// Delete the secret, then the metadata.
    ///
    /// A secret that is already gone is not an error. Missing metadata is
    /// `CredentialNotFound`.
    pub async fn delete(&self, repository_id: &str) -> BrokerResult<()> {
        match self.secrets.delete(&self.service, repository_id).await {
            Ok(()) | Err(BrokerError::SecretNotFound) => {}
            Err(e) => return Err(e),
        }

        match self.records().delete(repository_id) {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {
                return Err(BrokerError::CredentialNotFound(repository_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        info!(repository_id = %repository_id, "Credential deleted");
        self.audit.record(
            AuditEvent::new(AuditEventType::CredentialDeleted)
                .with_resource("credential", repository_id),
        );
        Ok(())
    }

    /// Every credential whose secret is available.
    ///
    /// Records whose secret cannot be read are skipped with a warning.
    pub async fn list(&self) -> BrokerResult<Vec<Credential>> {
        let records = self.records().list()?;

        let mut credentials = Vec::with_capacity(records.len());
        for record in records {
            match self.secrets.get(&self.service, &record.repository_id).await {
                Ok(secret) => credentials.push(Credential { record, secret }),
                Err(e) => warn!(
                    repository_id = %record.repository_id,
                    error = %e,
                    "Skipping credential with unavailable secret"
                ),
            }
        }
        Ok(credentials)
    }

    /// Metadata only, without touching the secret store.
    pub fn record(&self, repository_id: &str) -> BrokerResult<CredentialRecord> {
        self.load_record(repository_id)
    }

    fn load_record(&self, repository_id: &str) -> BrokerResult<CredentialRecord> {
        match self.records().get(repository_id) {
            Ok(record) => Ok(record),
            Err(StorageError::NotFound(_)) => {
                Err(BrokerError::CredentialNotFound(repository_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoragePaths;
    use crate::testing::MemorySecretStore;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    const SERVICE: &str = "test.repository";

    struct Fixture {
        _dir: TempDir,
        storage: Arc<PrivateStorage>,
        store: Arc<MemorySecretStore>,
        vault: CredentialVault,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut storage = PrivateStorage::new(StoragePaths::new(dir.path()));
        storage.initialize().unwrap();
        let storage = Arc::new(storage);
        let store = Arc::new(MemorySecretStore::new());
        let vault = CredentialVault::new(
            storage.clone(),
            SecretVault::new(store.clone()),
            SERVICE,
            Arc::new(AuditLog::new(storage.clone())),
        );
        Fixture {
            _dir: dir,
            storage,
            store,
            vault,
        }
    }

    fn record(id: &str) -> CredentialRecord {
        CredentialRecord::new(id, format!("/Volumes/Backup/{id}"))
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trips() {
        let f = setup();
        let record = record("repo-1").with_key_file("repo-1.key");
        f.vault.store(&record, &Secret::from("pw")).await.unwrap();

        let credential = f.vault.retrieve("repo-1").await.unwrap();
        assert_eq!(credential.record, record);
        assert_eq!(credential.secret.expose(), b"pw");
    }

    #[tokio::test]
    async fn metadata_never_contains_secret() {
        let f = setup();
        f.vault
            .store(&record("repo-1"), &Secret::from("s3cr3t-value"))
            .await
            .unwrap();

        for key in f
            .storage
            .list_files(f.storage.paths().credentials_dir(), "json")
            .unwrap()
        {
            let raw = f
                .storage
                .read_raw(f.storage.paths().credential(&key))
                .unwrap();
            assert!(!String::from_utf8_lossy(&raw).contains("s3cr3t-value"));
        }
    }

    #[tokio::test]
    async fn missing_metadata_and_missing_secret_are_distinct() {
        let f = setup();
        assert!(matches!(
            f.vault.retrieve("nope").await,
            Err(BrokerError::CredentialNotFound(id)) if id == "nope"
        ));

        f.vault.store(&record("drift"), &Secret::from("pw")).await.unwrap();
        f.store.forget(SERVICE, "drift");
        assert!(matches!(
            f.vault.retrieve("drift").await,
            Err(BrokerError::SecretNotFound)
        ));
    }

    #[tokio::test]
    async fn retry_after_orphaned_secret_succeeds() {
        let f = setup();
        // Simulate an earlier store whose metadata write never happened.
        SecretVault::new(f.store.clone())
            .add(SERVICE, "repo-1", &Secret::from("old"))
            .await
            .unwrap();

        f.vault.store(&record("repo-1"), &Secret::from("new")).await.unwrap();
        assert_eq!(f.vault.retrieve("repo-1").await.unwrap().secret.expose(), b"new");
    }

    #[tokio::test]
    async fn failed_secret_write_leaves_no_metadata() {
        let f = setup();
        f.store.fail_writes(true);

        assert!(f.vault.store(&record("repo-1"), &Secret::from("pw")).await.is_err());
        assert!(matches!(
            f.vault.record("repo-1"),
            Err(BrokerError::CredentialNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_uses_in_place_primitive() {
        let f = setup();
        f.vault.store(&record("repo-1"), &Secret::from("one")).await.unwrap();

        let moved = CredentialRecord::new("repo-1", "/Volumes/Other");
        f.vault.update(&moved, Some(&Secret::from("two"))).await.unwrap();

        let credential = f.vault.retrieve("repo-1").await.unwrap();
        assert_eq!(credential.record.repository_path, moved.repository_path);
        assert_eq!(credential.secret.expose(), b"two");
        assert_eq!(f.store.updates.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_without_secret_keeps_it() {
        let f = setup();
        f.vault.store(&record("repo-1"), &Secret::from("one")).await.unwrap();
        f.vault
            .update(&record("repo-1").with_key_file("k"), None)
            .await
            .unwrap();

        let credential = f.vault.retrieve("repo-1").await.unwrap();
        assert_eq!(credential.record.key_file_name.as_deref(), Some("k"));
        assert_eq!(credential.secret.expose(), b"one");
    }

    #[tokio::test]
    async fn delete_tolerates_missing_secret() {
        let f = setup();
        f.vault.store(&record("repo-1"), &Secret::from("pw")).await.unwrap();
        f.store.forget(SERVICE, "repo-1");

        f.vault.delete("repo-1").await.unwrap();
        assert!(matches!(
            f.vault.delete("repo-1").await,
            Err(BrokerError::CredentialNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_skips_credentials_with_missing_secrets() {
        let f = setup();
        for id in ["a", "b", "c"] {
            f.vault.store(&record(id), &Secret::from(id)).await.unwrap();
        }
        f.store.forget(SERVICE, "b");

        let ids: Vec<_> = f
            .vault
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.record.repository_id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn store_is_audited() {
        let f = setup();
        f.vault.store(&record("repo-1"), &Secret::from("pw")).await.unwrap();

        let audit = AuditLog::new(f.storage.clone());
        let events = audit.events_today(AuditEventType::CredentialStored);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resource_id.as_deref(), Some("repo-1"));
    }
}
