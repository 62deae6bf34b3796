// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Process-wide wiring of the broker components.
//!
//! Each component is constructed once and handed to its dependents
//! explicitly. Nothing here is global; tests build their own context over
//! fakes with [`BrokerContext::with_backends`].

use std::sync::Arc;

use tracing::info;

use crate::capability::CapabilityBroker;
use crate::config::BrokerConfig;
use crate::credentials::CredentialVault;
use crate::error::{BrokerError, BrokerResult};
use crate::ipc::{BridgeSettings, HelperTransport, IpcBridge, UnixSocketTransport};
use crate::monitor::SandboxMonitor;
use crate::permissions::{ConsentGate, PathExistsConsent, PermissionStore};
use crate::platform::file_secrets::FileSecretStore;
use crate::platform::local::LocalCapabilityApi;
use crate::platform::{CapabilityApi, SecretStore};
use crate::secrets::SecretVault;
use crate::storage::{AuditLog, PrivateStorage, StoragePaths};
use crate::violations::ViolationLog;

/// OS-facing backends the broker runs over.
pub struct Backends {
    pub capability_api: Arc<dyn CapabilityApi>,
    pub secret_store: Arc<dyn SecretStore>,
    pub transport: Arc<dyn HelperTransport>,
    pub consent: Arc<dyn ConsentGate>,
}

/// All broker components for one process.
#[derive(Clone)]
pub struct BrokerContext {
    pub config: BrokerConfig,
    pub storage: Arc<PrivateStorage>,
    pub audit: Arc<AuditLog>,
    pub broker: Arc<CapabilityBroker>,
    pub permissions: Arc<PermissionStore>,
    pub credentials: Arc<CredentialVault>,
    pub violations: Arc<ViolationLog>,
    pub monitor: Arc<SandboxMonitor>,
    pub bridge: Arc<IpcBridge>,
}

/// Initialize the private data directory for `config`.
pub fn open_storage(config: &BrokerConfig) -> BrokerResult<PrivateStorage> {
    let mut storage = PrivateStorage::new(StoragePaths::new(&config.data_dir));
    storage.initialize()?;
    storage.health_check()?;
    Ok(storage)
}

/// The shipped capability backend, keyed from `storage`.
pub fn local_capability_api(storage: &PrivateStorage) -> BrokerResult<LocalCapabilityApi> {
    LocalCapabilityApi::open(storage)
        .map_err(|e| BrokerError::PersistenceFailed(format!("capability key: {e}")))
}

impl BrokerContext {
    /// Open storage and wire the shipped backends.
    pub fn open(config: BrokerConfig) -> BrokerResult<Self> {
        let storage = Arc::new(open_storage(&config)?);
        let backends = Backends {
            capability_api: Arc::new(local_capability_api(&storage)?),
            secret_store: Arc::new(FileSecretStore::new(storage.clone())),
            transport: Arc::new(UnixSocketTransport::new(&config.helper_socket)),
            consent: Arc::new(PathExistsConsent),
        };
        info!(data_dir = %config.data_dir.display(), "Broker storage ready");
        Ok(Self::with_backends(config, storage, backends))
    }

    /// Wire components over explicit backends and initialized storage.
    pub fn with_backends(config: BrokerConfig, storage: Arc<PrivateStorage>, backends: Backends) -> Self {
        let audit = Arc::new(AuditLog::new(storage.clone()));
        let violations = Arc::new(ViolationLog::new(config.violation_capacity));
        let broker = Arc::new(CapabilityBroker::new(backends.capability_api));

        let permissions = Arc::new(PermissionStore::new(
            storage.clone(),
            broker.clone(),
            backends.consent,
            audit.clone(),
        ));
        let credentials = Arc::new(CredentialVault::new(
            storage.clone(),
            SecretVault::new(backends.secret_store),
            config.secret_service.clone(),
            audit.clone(),
        ));
        let monitor = Arc::new(
            SandboxMonitor::new(broker.clone(), violations.clone(), config.monitor.clone())
                .with_audit(audit.clone()),
        );

        let mut settings = BridgeSettings::new(config.helper_identity.clone());
        settings.allowed_endpoints = config.allowed_endpoints.clone();
        settings.connect_timeout = config.connect_timeout;
        settings.request_timeout = config.request_timeout;
        let bridge = Arc::new(
            IpcBridge::new(backends.transport, settings, violations.clone()).with_audit(audit.clone()),
        );

        Self {
            config,
            storage,
            audit,
            broker,
            permissions,
            credentials,
            violations,
            monitor,
            bridge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ConnectionState, HelperCommand};
    use crate::secrets::Secret;
    use crate::storage::CredentialRecord;
    use crate::testing::FakeTransport;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> BrokerConfig {
        BrokerConfig::from_lookup(|name| {
            (name == crate::config::DATA_DIR_ENV).then(|| dir.path().join("data").display().to_string())
        })
    }

    #[tokio::test]
    async fn permissions_survive_a_relaunch() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("backup-target");
        std::fs::create_dir(&target).unwrap();

        let first = BrokerContext::open(config_for(&dir)).unwrap();
        assert!(first.permissions.request_and_persist(&target).await.unwrap());
        drop(first);

        let second = BrokerContext::open(config_for(&dir)).unwrap();
        let summary = second.permissions.restore_all().await.unwrap();
        assert_eq!(summary.restored, 1);
        assert_eq!(summary.purged, 0);

        let token = second.permissions.valid_token(&target).await.unwrap().unwrap();
        let resolution = second.broker.resolve_token(&token).await.unwrap();
        assert_eq!(resolution.path, target);
    }

    #[tokio::test]
    async fn credentials_survive_a_relaunch() {
        let dir = TempDir::new().unwrap();
        let record = CredentialRecord::new("repo-1", dir.path().join("repo"));

        let first = BrokerContext::open(config_for(&dir)).unwrap();
        first
            .credentials
            .store(&record, &Secret::from("pw"))
            .await
            .unwrap();
        drop(first);

        let second = BrokerContext::open(config_for(&dir)).unwrap();
        let credential = second.credentials.retrieve("repo-1").await.unwrap();
        assert_eq!(credential.record, record);
        assert_eq!(credential.secret.expose_str(), Some("pw"));
    }

    #[tokio::test]
    async fn wired_bridge_uses_configured_identity() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let storage = Arc::new(open_storage(&config).unwrap());
        let transport = FakeTransport::new(
            &config.helper_socket.display().to_string(),
            &config.helper_identity,
        );

        let context = BrokerContext::with_backends(
            config,
            storage.clone(),
            Backends {
                capability_api: Arc::new(local_capability_api(&storage).unwrap()),
                secret_store: Arc::new(FileSecretStore::new(storage.clone())),
                transport: Arc::new(transport),
                consent: Arc::new(PathExistsConsent),
            },
        );

        let output = context
            .bridge
            .execute(HelperCommand::new("restic").arg("version"), None)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(context.bridge.state(), ConnectionState::Connected);
    }
}
