// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Connection state machine to the out-of-process helper.
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Connected ──▶ Interrupted ──▶ Connected
//!       ▲                              │              │
//!       │                              ▼              ▼
//!       └──────── disconnect() ── (any state)     Invalidated
//! ```
//!
//! - A transport hiccup or a timed-out call moves `Connected` to
//!   `Interrupted` and drops the channel. The next call makes exactly one
//!   reconnect attempt before failing with `ServiceUnavailable`.
//! - A fatal transport failure (helper gone) moves to `Invalidated`. Nothing
//!   succeeds until the caller issues `connect()` again.
//! - The first call on a `Disconnected` bridge connects lazily.
//!
//! Every channel carries a generation number. Failures observed on an old
//! channel never downgrade a newer connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::protocol::{
    CommandOutput, HelperCommand, HelperRequest, HelperResponse, PROTOCOL_VERSION,
};
use super::transport::{HelperChannel, HelperTransport, TransportError};
use crate::capability::CapabilityToken;
use crate::error::{BrokerError, BrokerResult};
use crate::storage::{AuditEvent, AuditEventType, AuditLog};
use crate::violations::{ViolationKind, ViolationLog, ViolationRecord};

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
    Invalidated,
}

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Identity the helper must present in its handshake.
    pub expected_identity: String,
    /// Endpoints the bridge may dial. Empty allows only the configured one.
    pub allowed_endpoints: Vec<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Sent to the helper for its logs.
    pub client_info: String,
}

impl BridgeSettings {
    pub fn new(expected_identity: impl Into<String>) -> Self {
        Self {
            expected_identity: expected_identity.into(),
            allowed_endpoints: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            client_info: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

struct BridgeInner {
    state: ConnectionState,
    channel: Option<Arc<dyn HelperChannel>>,
    generation: u64,
}

/// Client side of the helper connection.
pub struct IpcBridge {
    transport: Arc<dyn HelperTransport>,
    settings: BridgeSettings,
    violations: Arc<ViolationLog>,
    audit: Option<Arc<AuditLog>>,
    inner: Mutex<BridgeInner>,
    // Serializes connection attempts; never held by other components.
    connect_lock: tokio::sync::Mutex<()>,
}

impl IpcBridge {
    pub fn new(
        transport: Arc<dyn HelperTransport>,
        settings: BridgeSettings,
        violations: Arc<ViolationLog>,
    ) -> Self {
        Self {
            transport,
            settings,
            violations,
            audit: None,
            inner: Mutex::new(BridgeInner {
                state: ConnectionState::Disconnected,
                channel: None,
                generation: 0,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Record connection events in the audit trail.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    /// Connect and handshake. A no-op when already connected.
    ///
    /// This is the only way out of `Invalidated`.
    pub async fn connect(&self) -> BrokerResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.establish().await
    }

    /// Tear the connection down.
    pub fn disconnect(&self) {
        let mut inner = self.lock_inner();
        inner.channel = None;
        inner.generation += 1;
        if inner.state != ConnectionState::Disconnected {
            info!(endpoint = %self.transport.endpoint(), "Helper connection closed");
        }
        inner.state = ConnectionState::Disconnected;
    }

    /// Transport callback: the current connection hiccupped.
    pub fn on_interrupted(&self, reason: &str) {
        let generation = self.lock_inner().generation;
        self.mark_failed(generation, ConnectionState::Interrupted, reason);
    }

    /// Transport callback: the helper went away.
    pub fn on_invalidated(&self, reason: &str) {
        let generation = self.lock_inner().generation;
        self.mark_failed(generation, ConnectionState::Invalidated, reason);
    }

    /// Run `command` in the helper, passing `token` so the helper can open
    /// its own access window on the location.
    pub async fn execute(
        &self,
        command: HelperCommand,
        token: Option<CapabilityToken>,
    ) -> BrokerResult<CommandOutput> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let program = command.program.clone();
        let (response, generation) = self
            .round_trip(HelperRequest::Execute {
                request_id: request_id.clone(),
                command,
                token,
            })
            .await?;

        match response {
            HelperResponse::Output {
                request_id: answered,
                output,
            } if answered == request_id => {
                debug!(program = %program, exit_code = output.exit_code, "Helper command finished");
                Ok(output)
            }
            HelperResponse::Failed {
                request_id: answered,
                reason,
            } if answered == request_id => {
                warn!(program = %program, reason = %reason, "Helper command failed");
                Err(BrokerError::ExecutionFailed(reason))
            }
            other => Err(self.unexpected(generation, &other)),
        }
    }

    /// Ask the helper to open an access window on `path`.
    pub async fn start_accessing(&self, path: &std::path::Path) -> BrokerResult<bool> {
        let (response, generation) = self
            .round_trip(HelperRequest::StartAccessing {
                path: path.to_path_buf(),
            })
            .await?;
        match response {
            HelperResponse::Access { granted } => Ok(granted),
            other => Err(self.unexpected(generation, &other)),
        }
    }

    /// Ask the helper to close its access window on `path`.
    pub async fn stop_accessing(&self, path: &std::path::Path) -> BrokerResult<()> {
        let (response, generation) = self
            .round_trip(HelperRequest::StopAccessing {
                path: path.to_path_buf(),
            })
            .await?;
        match response {
            HelperResponse::Ack => Ok(()),
            other => Err(self.unexpected(generation, &other)),
        }
    }

    /// Ask the helper whether its open access windows are still usable.
    pub async fn validate_permissions(&self) -> BrokerResult<bool> {
        let (response, generation) = self.round_trip(HelperRequest::ValidatePermissions).await?;
        match response {
            HelperResponse::Valid { ok } => Ok(ok),
            other => Err(self.unexpected(generation, &other)),
        }
    }

    // ========== Internals ==========

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BridgeInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock_inner().state = state;
    }

    fn endpoint_allowed(&self, endpoint: &str) -> bool {
        self.settings.allowed_endpoints.is_empty()
            || self.settings.allowed_endpoints.iter().any(|e| e == endpoint)
    }

    /// Dial and handshake. Caller holds `connect_lock`.
    async fn establish(&self) -> BrokerResult<()> {
        let endpoint = self.transport.endpoint().to_string();
        if !self.endpoint_allowed(&endpoint) {
            self.violations.record(ViolationRecord::new(
                ViolationKind::UnauthorizedIpcTarget,
                endpoint.clone(),
            ));
            self.audit(
                AuditEvent::new(AuditEventType::PolicyViolation)
                    .with_resource("endpoint", endpoint.clone())
                    .failed("endpoint not on allow-list"),
            );
            return Err(BrokerError::ConnectionFailed(format!(
                "endpoint {endpoint} is not allowed"
            )));
        }

        self.set_state(ConnectionState::Connecting);
        debug!(endpoint = %endpoint, "Connecting to helper");

        let outcome = tokio::time::timeout(self.settings.connect_timeout, self.handshake()).await;
        let failure = match outcome {
            Ok(Ok(channel)) => {
                let mut inner = self.lock_inner();
                inner.generation += 1;
                inner.channel = Some(channel);
                inner.state = ConnectionState::Connected;
                drop(inner);
                info!(endpoint = %endpoint, "Connected to helper");
                self.audit(
                    AuditEvent::new(AuditEventType::HelperConnected)
                        .with_resource("endpoint", endpoint),
                );
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::Interrupted(format!(
                "handshake timed out after {:?}",
                self.settings.connect_timeout
            )),
        };

        let next = match failure {
            TransportError::Invalidated(_) => ConnectionState::Invalidated,
            _ => ConnectionState::Disconnected,
        };
        self.set_state(next);
        warn!(endpoint = %endpoint, error = %failure, state = ?next, "Helper connection failed");
        if next == ConnectionState::Invalidated {
            self.audit(
                AuditEvent::new(AuditEventType::HelperInvalidated)
                    .with_resource("endpoint", endpoint)
                    .failed(failure.to_string()),
            );
        }
        Err(BrokerError::ConnectionFailed(failure.to_string()))
    }

    async fn handshake(&self) -> Result<Arc<dyn HelperChannel>, TransportError> {
        let channel: Arc<dyn HelperChannel> = Arc::from(self.transport.connect().await?);
        let nonce = uuid::Uuid::new_v4().to_string();

        let response = channel
            .call(HelperRequest::Hello {
                protocol_version: PROTOCOL_VERSION,
                client_info: self.settings.client_info.clone(),
                nonce: nonce.clone(),
            })
            .await?;

        match response {
            HelperResponse::HelloAck {
                protocol_version,
                helper_identity,
                nonce: echoed,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(TransportError::PeerRejected(format!(
                        "protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
                    )));
                }
                if echoed != nonce {
                    return Err(TransportError::PeerRejected(
                        "handshake nonce mismatch".to_string(),
                    ));
                }
                if helper_identity != self.settings.expected_identity {
                    return Err(TransportError::PeerRejected(format!(
                        "unexpected helper identity {helper_identity:?}"
                    )));
                }
                Ok(channel)
            }
            HelperResponse::HelloNack { reason } => Err(TransportError::PeerRejected(reason)),
            other => Err(TransportError::Protocol(format!(
                "unexpected handshake response {other:?}"
            ))),
        }
    }

    /// Current channel, reconnecting once if the bridge is not connected.
    async fn ready_channel(&self) -> BrokerResult<(Arc<dyn HelperChannel>, u64)> {
        if let Some(ready) = self.current_channel()? {
            return Ok(ready);
        }

        let _guard = self.connect_lock.lock().await;
        // Another caller may have reconnected while we waited.
        if let Some(ready) = self.current_channel()? {
            return Ok(ready);
        }

        let previous = self.state();
        debug!(state = ?previous, "Reconnecting to helper before request");
        if let Err(e) = self.establish().await {
            warn!(error = %e, "Reconnect attempt failed");
            return Err(BrokerError::ServiceUnavailable);
        }
        self.current_channel()?
            .ok_or(BrokerError::ServiceUnavailable)
    }

    /// `Ok(Some)` when connected, `Ok(None)` when a reconnect may be tried,
    /// `Err` when invalidated.
    fn current_channel(&self) -> BrokerResult<Option<(Arc<dyn HelperChannel>, u64)>> {
        let inner = self.lock_inner();
        match (inner.state, &inner.channel) {
            (ConnectionState::Connected, Some(channel)) => {
                Ok(Some((Arc::clone(channel), inner.generation)))
            }
            (ConnectionState::Invalidated, _) => Err(BrokerError::ServiceUnavailable),
            _ => Ok(None),
        }
    }

    async fn round_trip(&self, request: HelperRequest) -> BrokerResult<(HelperResponse, u64)> {
        let (channel, generation) = self.ready_channel().await?;
        let timeout = self.settings.request_timeout;

        match tokio::time::timeout(timeout, channel.call(request)).await {
            Ok(Ok(response)) => Ok((response, generation)),
            Ok(Err(TransportError::Invalidated(reason))) => {
                self.mark_failed(generation, ConnectionState::Invalidated, &reason);
                Err(BrokerError::ServiceUnavailable)
            }
            Ok(Err(e)) => {
                self.mark_failed(generation, ConnectionState::Interrupted, &e.to_string());
                Err(BrokerError::ServiceUnavailable)
            }
            Err(_) => {
                // The helper's state is unknown; drop the channel so a late
                // response cannot be read as the answer to a later request.
                self.mark_failed(generation, ConnectionState::Interrupted, "request timed out");
                Err(BrokerError::Timeout(timeout))
            }
        }
    }

    fn unexpected(&self, generation: u64, response: &HelperResponse) -> BrokerError {
        self.mark_failed(generation, ConnectionState::Interrupted, "unexpected response");
        BrokerError::ValidationFailed(format!("unexpected helper response {response:?}"))
    }

    fn mark_failed(&self, generation: u64, next: ConnectionState, reason: &str) {
        let mut inner = self.lock_inner();
        if inner.generation != generation || inner.state != ConnectionState::Connected {
            return;
        }
        inner.state = next;
        inner.channel = None;
        drop(inner);

        warn!(
            endpoint = %self.transport.endpoint(),
            state = ?next,
            reason = %reason,
            "Helper connection lost"
        );
        if next == ConnectionState::Invalidated {
            self.audit(
                AuditEvent::new(AuditEventType::HelperInvalidated)
                    .with_resource("endpoint", self.transport.endpoint())
                    .failed(reason),
            );
        }
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event);
        }
    }
}
