// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Test doubles for the platform and transport contracts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ipc::protocol::{HelperRequest, HelperResponse, PROTOCOL_VERSION};
use crate::ipc::transport::{HelperChannel, HelperTransport, TransportError};
use crate::platform::{CapabilityApi, PlatformError, Resolution, SecretStore, SecretStoreError};

const FAKE_PREFIX: &str = "fake-token:";

#[derive(Default)]
struct FakeApiState {
    begins: HashMap<PathBuf, usize>,
    ends: HashMap<PathBuf, usize>,
    refused: HashSet<PathBuf>,
    denied_tokens: HashSet<PathBuf>,
    missing: HashSet<PathBuf>,
    stale_below: HashMap<PathBuf, u64>,
    repointed: HashMap<PathBuf, PathBuf>,
}

/// In-memory capability API counting begin/end calls per path.
///
/// Tokens are `fake-token:<generation>:<path>`.
#[derive(Default)]
pub struct FakeCapabilityApi {
    state: Mutex<FakeApiState>,
    generation: AtomicU64,
}

impl FakeCapabilityApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeApiState> {
        self.state.lock().unwrap()
    }

    pub fn begin_calls(&self, path: &Path) -> usize {
        self.state().begins.get(path).copied().unwrap_or(0)
    }

    pub fn end_calls(&self, path: &Path) -> usize {
        self.state().ends.get(path).copied().unwrap_or(0)
    }

    /// `begin_access` on `path` returns false.
    pub fn refuse_access(&self, path: &Path) {
        self.state().refused.insert(path.to_path_buf());
    }

    /// `create_token` on `path` fails with `Denied`.
    pub fn deny_tokens(&self, path: &Path) {
        self.state().denied_tokens.insert(path.to_path_buf());
    }

    /// Resolving any token for `path` fails with `NotFound`.
    pub fn remove_resource(&self, path: &Path) {
        self.state().missing.insert(path.to_path_buf());
    }

    /// Every token issued for `path` so far resolves as stale.
    pub fn mark_stale(&self, path: &Path) {
        let next = self.generation.load(Ordering::SeqCst) + 1;
        self.state().stale_below.insert(path.to_path_buf(), next);
    }

    /// Tokens for `from` resolve to `to`.
    pub fn repoint(&self, from: &Path, to: &Path) {
        self.state()
            .repointed
            .insert(from.to_path_buf(), to.to_path_buf());
    }
}

#[async_trait]
impl CapabilityApi for FakeCapabilityApi {
    async fn create_token(&self, path: &Path, _read_only: bool) -> Result<Vec<u8>, PlatformError> {
        if self.state().denied_tokens.contains(path) {
            return Err(PlatformError::Denied(path.display().to_string()));
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{FAKE_PREFIX}{generation}:{}", path.display()).into_bytes())
    }

    async fn resolve(&self, token: &[u8]) -> Result<Resolution, PlatformError> {
        let text = std::str::from_utf8(token)
            .map_err(|_| PlatformError::Corrupt("not utf-8".to_string()))?;
        let rest = text
            .strip_prefix(FAKE_PREFIX)
            .ok_or_else(|| PlatformError::Corrupt("bad prefix".to_string()))?;
        let (generation, path) = rest
            .split_once(':')
            .ok_or_else(|| PlatformError::Corrupt("bad layout".to_string()))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| PlatformError::Corrupt("bad generation".to_string()))?;

        let path = PathBuf::from(path);
        let state = self.state();
        if state.missing.contains(&path) {
            return Err(PlatformError::NotFound(path.display().to_string()));
        }
        let is_stale = state
            .stale_below
            .get(&path)
            .is_some_and(|threshold| generation < *threshold);
        let path = state.repointed.get(&path).cloned().unwrap_or(path);
        Ok(Resolution { path, is_stale })
    }

    async fn begin_access(&self, path: &Path) -> bool {
        if self.state().refused.contains(path) {
            return false;
        }
        // Give racing callers a chance to interleave inside the 0->1 edge.
        tokio::task::yield_now().await;
        *self.state().begins.entry(path.to_path_buf()).or_default() += 1;
        true
    }

    async fn end_access(&self, path: &Path) {
        tokio::task::yield_now().await;
        *self.state().ends.entry(path.to_path_buf()).or_default() += 1;
    }
}

/// In-memory secret store with call counters and failure injection.
#[derive(Default)]
pub struct MemorySecretStore {
    items: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, service: &str, account: &str) -> bool {
        self.items
            .lock()
            .unwrap()
            .contains_key(&(service.to_string(), account.to_string()))
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Remove an item behind the vault's back to simulate drift.
    pub fn forget(&self, service: &str, account: &str) {
        self.items
            .lock()
            .unwrap()
            .remove(&(service.to_string(), account.to_string()));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), SecretStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(SecretStoreError::Backend("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn add(&self, service: &str, account: &str, data: &[u8]) -> Result<(), SecretStoreError> {
        self.check_writable()?;
        let mut items = self.items.lock().unwrap();
        let key = (service.to_string(), account.to_string());
        if items.contains_key(&key) {
            return Err(SecretStoreError::Duplicate);
        }
        items.insert(key, data.to_vec());
        Ok(())
    }

    async fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, SecretStoreError> {
        self.items
            .lock()
            .unwrap()
            .get(&(service.to_string(), account.to_string()))
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    async fn update(
        &self,
        service: &str,
        account: &str,
        data: &[u8],
    ) -> Result<(), SecretStoreError> {
        self.check_writable()?;
        let mut items = self.items.lock().unwrap();
        let slot = items
            .get_mut(&(service.to_string(), account.to_string()))
            .ok_or(SecretStoreError::NotFound)?;
        *slot = data.to_vec();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        self.check_writable()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.items
            .lock()
            .unwrap()
            .remove(&(service.to_string(), account.to_string()))
            .map(|_| ())
            .ok_or(SecretStoreError::NotFound)
    }
}

/// Behaviour of the fake helper for the next calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeHelperMode {
    /// Answer every request.
    Healthy,
    /// Fail the next call with `Interrupted`, then answer.
    InterruptOnce,
    /// Fail every call with `Invalidated`.
    Crashed,
    /// Never answer.
    Hang,
}

struct FakeHelper {
    identity: String,
    mode: Mutex<FakeHelperMode>,
    reachable: AtomicBool,
    connects: AtomicUsize,
    executes: AtomicUsize,
}

/// In-memory transport standing in for the helper process.
#[derive(Clone)]
pub struct FakeTransport {
    endpoint: String,
    helper: Arc<FakeHelper>,
}

impl FakeTransport {
    pub fn new(endpoint: &str, identity: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            helper: Arc::new(FakeHelper {
                identity: identity.to_string(),
                mode: Mutex::new(FakeHelperMode::Healthy),
                reachable: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                executes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_mode(&self, mode: FakeHelperMode) {
        *self.helper.mode.lock().unwrap() = mode;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.helper.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.helper.connects.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.helper.executes.load(Ordering::SeqCst)
    }
}

struct FakeChannel {
    helper: Arc<FakeHelper>,
}

#[async_trait]
impl HelperTransport for FakeTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn HelperChannel>, TransportError> {
        if !self.helper.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Invalidated("connection refused".to_string()));
        }
        self.helper.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChannel {
            helper: Arc::clone(&self.helper),
        }))
    }
}

#[async_trait]
impl HelperChannel for FakeChannel {
    async fn call(&self, request: HelperRequest) -> Result<HelperResponse, TransportError> {
        let mode = *self.helper.mode.lock().unwrap();
        match mode {
            FakeHelperMode::Healthy => {}
            FakeHelperMode::InterruptOnce => {
                *self.helper.mode.lock().unwrap() = FakeHelperMode::Healthy;
                return Err(TransportError::Interrupted("transient hiccup".to_string()));
            }
            FakeHelperMode::Crashed => {
                return Err(TransportError::Invalidated("helper exited".to_string()));
            }
            FakeHelperMode::Hang => {
                std::future::pending::<()>().await;
            }
        }

        Ok(match request {
            HelperRequest::Hello { nonce, .. } => HelperResponse::HelloAck {
                protocol_version: PROTOCOL_VERSION,
                helper_identity: self.helper.identity.clone(),
                nonce,
            },
            HelperRequest::Execute {
                request_id,
                command,
                token,
            } => {
                self.helper.executes.fetch_add(1, Ordering::SeqCst);
                if command.program == "false" {
                    HelperResponse::Failed {
                        request_id,
                        reason: "exit status 1".to_string(),
                    }
                } else {
                    HelperResponse::Output {
                        request_id,
                        output: crate::ipc::protocol::CommandOutput {
                            exit_code: 0,
                            stdout: format!(
                                "{} {} token={}",
                                command.program,
                                command.args.join(" "),
                                token.is_some()
                            ),
                            stderr: String::new(),
                        },
                    }
                }
            }
            HelperRequest::StartAccessing { .. } => HelperResponse::Access { granted: true },
            HelperRequest::StopAccessing { .. } => HelperResponse::Ack,
            HelperRequest::ValidatePermissions => HelperResponse::Valid { ok: true },
        })
    }
}
