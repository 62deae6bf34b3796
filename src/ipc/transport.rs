// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Transport contract between the bridge and a helper connection.

use async_trait::async_trait;

use super::protocol::{HelperRequest, HelperResponse};

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Transient hiccup; the helper may still be alive.
    #[error("connection interrupted: {0}")]
    Interrupted(String),

    /// The helper is gone (process exited, socket closed or refused).
    #[error("connection invalidated: {0}")]
    Invalidated(String),

    /// The peer sent something that is not a valid frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer failed identity checks.
    #[error("peer rejected: {0}")]
    PeerRejected(String),
}

/// Dials a named helper endpoint.
#[async_trait]
pub trait HelperTransport: Send + Sync {
    /// Name of the endpoint this transport dials.
    fn endpoint(&self) -> &str;

    /// Open a new channel. No handshake is performed here.
    async fn connect(&self) -> Result<Box<dyn HelperChannel>, TransportError>;
}

/// One established request/response channel.
#[async_trait]
pub trait HelperChannel: Send + Sync {
    /// Send a request and wait for its response.
    async fn call(&self, request: HelperRequest) -> Result<HelperResponse, TransportError>;
}
