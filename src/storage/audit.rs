// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Audit logging for security-sensitive broker operations.
//!
//! Permission grants and revocations, credential changes, forced access
//! releases and policy violations are appended to a daily JSONL file in the
//! private data directory. Audit writes are best-effort: a failure is logged
//! and never fails the operation being audited.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PrivateStorage, StorageError, StorageResult};

/// Types of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Permission events
    PermissionGranted,
    PermissionDenied,
    PermissionRecovered,
    PermissionPurged,
    PermissionRevoked,

    // Credential events
    CredentialStored,
    CredentialUpdated,
    CredentialDeleted,

    // Sandbox events
    AccessForceReleased,
    PolicyViolation,

    // Helper events
    HelperConnected,
    HelperInvalidated,
}

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of event.
    pub event_type: AuditEventType,
    /// Resource affected (path, repository id, endpoint).
    pub resource_id: Option<String>,
    /// Resource type (path, credential, endpoint).
    pub resource_type: Option<String>,
    /// Additional details as JSON.
    pub details: Option<serde_json::Value>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message if operation failed.
    pub error: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event.
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            resource_id: None,
            resource_type: None,
            details: None,
            success: true,
            error: None,
        }
    }

    /// Set the resource.
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Add details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark as failed with error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Append-only audit trail stored under `audit/`.
pub struct AuditLog {
    storage: std::sync::Arc<PrivateStorage>,
    // Appends are read-modify-write on the daily file.
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Create a new audit log over the given storage.
    pub fn new(storage: std::sync::Arc<PrivateStorage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Append an event, logging instead of failing on error.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(&event) {
            tracing::warn!(
                event_type = ?event.event_type,
                error = %e,
                "Failed to append audit event"
            );
        }
    }

    /// Log an audit event.
    ///
    /// Events are appended to a daily log file in JSONL format.
    pub fn log(&self, event: &AuditEvent) -> StorageResult<()> {
        let date = event.timestamp.format("%Y-%m-%d").to_string();
        let path = self.storage.paths().audit_events_file(&date);

        let event_json = serde_json::to_string(event).map_err(|e| {
            StorageError::SerializationError(format!("Failed to serialize audit event: {e}"))
        })?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut content = match self.storage.read_raw(&path) {
            Ok(content) => content,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        if !content.is_empty() && !content.ends_with(b"\n") {
            content.push(b'\n');
        }
        content.extend_from_slice(event_json.as_bytes());
        content.push(b'\n');

        self.storage.write_raw(&path, &content)
    }

    /// Read audit events for a specific date.
    pub fn read_events(&self, date: &str) -> StorageResult<Vec<AuditEvent>> {
        let path = self.storage.paths().audit_events_file(date);
        let content = self.storage.read_raw(&path)?;

        let content_str = String::from_utf8(content).map_err(|e| {
            StorageError::SerializationError(format!("Invalid UTF-8 in audit log: {e}"))
        })?;

        let mut events = Vec::new();
        for line in content_str.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(line).map_err(|e| {
                StorageError::SerializationError(format!(
                    "Failed to deserialize audit event: {e}"
                ))
            })?;
            events.push(event);
        }

        Ok(events)
    }

    /// Read today's events of one type (used by diagnostics and tests).
    pub fn events_today(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.read_events(&today)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoragePaths;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, AuditLog) {
        let temp = TempDir::new().unwrap();
        let mut storage = PrivateStorage::new(StoragePaths::new(temp.path()));
        storage.initialize().unwrap();
        (temp, AuditLog::new(Arc::new(storage)))
    }

    #[test]
    fn failed_event() {
        let event = AuditEvent::new(AuditEventType::PermissionDenied)
            .with_resource("path", "/Users/alice/Documents")
            .failed("consent refused");

        assert!(!event.success);
        assert_eq!(event.error, Some("consent refused".to_string()));
        assert_eq!(event.resource_type.as_deref(), Some("path"));
    }

    #[test]
    fn log_and_read_events() {
        let (_temp, audit) = setup();

        audit
            .log(&AuditEvent::new(AuditEventType::PermissionGranted).with_resource("path", "/a"))
            .unwrap();
        audit
            .log(&AuditEvent::new(AuditEventType::CredentialStored).with_resource("credential", "r1"))
            .unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let events = audit.read_events(&today).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::PermissionGranted);
        assert_eq!(events[1].event_type, AuditEventType::CredentialStored);
    }

    #[test]
    fn events_today_filters_by_type() {
        let (_temp, audit) = setup();

        audit.record(AuditEvent::new(AuditEventType::PolicyViolation));
        audit.record(AuditEvent::new(AuditEventType::PermissionRevoked));
        audit.record(AuditEvent::new(AuditEventType::PolicyViolation));

        assert_eq!(audit.events_today(AuditEventType::PolicyViolation).len(), 2);
        assert_eq!(audit.events_today(AuditEventType::PermissionRevoked).len(), 1);
        assert!(audit.events_today(AuditEventType::HelperConnected).is_empty());
    }
}
