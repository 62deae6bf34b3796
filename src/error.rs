// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Broker error taxonomy.
//!
//! Expected conditions (absent permission, stale token, helper not yet
//! connected) are reported as `bool`/`Option` results by the components.
//! The variants below are reserved for failures a caller cannot routinely
//! anticipate.

use std::path::PathBuf;
use std::time::Duration;

/// Error type shared by all broker components.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to create capability token for {}: {reason}", .path.display())]
    TokenCreationFailed { path: PathBuf, reason: String },

    #[error("failed to resolve capability token: {0}")]
    TokenResolutionFailed(String),

    #[error("capability token for {} is stale", .0.display())]
    TokenStale(PathBuf),

    #[error("failed to refresh capability token for {}: {reason}", .path.display())]
    TokenRefreshFailed { path: PathBuf, reason: String },

    #[error("access denied to {}", .0.display())]
    AccessDenied(PathBuf),

    #[error("failed to persist broker state: {0}")]
    PersistenceFailed(String),

    #[error("failed to recover permission for {}: {reason}", .path.display())]
    RecoveryFailed { path: PathBuf, reason: String },

    #[error("failed to revoke permission for {}: {reason}", .path.display())]
    RevocationFailed { path: PathBuf, reason: String },

    #[error("secret not found for credential")]
    SecretNotFound,

    #[error("credential not found: {0}")]
    CredentialNotFound(String),

    #[error("a secret already exists for this credential")]
    DuplicateSecret,

    #[error("failed to connect to helper: {0}")]
    ConnectionFailed(String),

    #[error("helper service unavailable")]
    ServiceUnavailable,

    #[error("helper reported failure: {0}")]
    ExecutionFailed(String),

    #[error("helper did not respond within {0:?}")]
    Timeout(Duration),

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            BrokerError::TokenCreationFailed { .. } => "token_creation_failed",
            BrokerError::TokenResolutionFailed(_) => "token_resolution_failed",
            BrokerError::TokenStale(_) => "token_stale",
            BrokerError::TokenRefreshFailed { .. } => "token_refresh_failed",
            BrokerError::AccessDenied(_) => "access_denied",
            BrokerError::PersistenceFailed(_) => "persistence_failed",
            BrokerError::RecoveryFailed { .. } => "recovery_failed",
            BrokerError::RevocationFailed { .. } => "revocation_failed",
            BrokerError::SecretNotFound => "secret_not_found",
            BrokerError::CredentialNotFound(_) => "credential_not_found",
            BrokerError::DuplicateSecret => "duplicate_secret",
            BrokerError::ConnectionFailed(_) => "connection_failed",
            BrokerError::ServiceUnavailable => "service_unavailable",
            BrokerError::ExecutionFailed(_) => "execution_failed",
            BrokerError::Timeout(_) => "timeout",
            BrokerError::ValidationFailed(_) => "validation_failed",
        }
    }

    /// Message suitable for showing to the user.
    ///
    /// Transport detail is collapsed into a retryable "service unavailable"
    /// and credential lookups never reveal which half of a credential is
    /// missing.
    pub fn user_message(&self) -> &'static str {
        match self {
            BrokerError::TokenCreationFailed { .. }
            | BrokerError::TokenResolutionFailed(_)
            | BrokerError::TokenStale(_)
            | BrokerError::TokenRefreshFailed { .. }
            | BrokerError::AccessDenied(_)
            | BrokerError::RecoveryFailed { .. } => {
                "Access to this location needs to be granted again."
            }
            BrokerError::PersistenceFailed(_) | BrokerError::RevocationFailed { .. } => {
                "Could not save settings. Check available disk space and try again."
            }
            BrokerError::SecretNotFound
            | BrokerError::CredentialNotFound(_)
            | BrokerError::DuplicateSecret => "Repository credentials are unavailable.",
            BrokerError::ConnectionFailed(_)
            | BrokerError::ServiceUnavailable
            | BrokerError::Timeout(_) => "The backup service is unavailable. Please retry.",
            BrokerError::ExecutionFailed(_) => "The backup command failed.",
            BrokerError::ValidationFailed(_) => "The request was rejected.",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed(_)
                | BrokerError::ServiceUnavailable
                | BrokerError::Timeout(_)
        )
    }
}

impl From<crate::storage::StorageError> for BrokerError {
    fn from(e: crate::storage::StorageError) -> Self {
        BrokerError::PersistenceFailed(e.to_string())
    }
}
