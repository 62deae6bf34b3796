// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Sandbox Monitor
//!
//! Background task that watches open access windows and remediates policy
//! violations.
//!
//! ## Strategy
//!
//! Every `interval` (default 60 s) the monitor:
//! 1. Snapshots all open access windows from the [`CapabilityBroker`].
//! 2. Flags windows under a denied system prefix. Each window is recorded
//!    once, not on every sweep, and is left open.
//! 3. Force-releases windows open longer than `max_access_duration` and
//!    records a long-running-access violation for each.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`. Cancellation stops the loop
//! between sweeps and touches no access window.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{normalize_path, AccessSnapshot, CapabilityBroker};
use crate::storage::{AuditEvent, AuditEventType, AuditLog};
use crate::violations::{ViolationKind, ViolationLog, ViolationRecord};

/// Default interval between sweeps.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default longest allowed access window.
pub const DEFAULT_MAX_ACCESS_DURATION: Duration = Duration::from_secs(300);

/// Default denied system prefixes.
pub const DEFAULT_DENIED_PREFIXES: &[&str] = &[
    "/System",
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/etc",
    "/private/etc",
    "/private/var/db",
    "/proc",
    "/sys",
    "/dev",
];

/// Monitor policy.
#[derive(Debug, Clone)]
pub struct MonitorPolicy {
    pub interval: Duration,
    pub max_access_duration: Duration,
    pub denied_prefixes: Vec<PathBuf>,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_access_duration: DEFAULT_MAX_ACCESS_DURATION,
            denied_prefixes: DEFAULT_DENIED_PREFIXES
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

impl MonitorPolicy {
    /// Whether `path` lies under a denied prefix (component-wise, after
    /// `.` and `..` are resolved).
    pub fn is_system_path(&self, path: &Path) -> bool {
        let path = normalize_path(path);
        self.denied_prefixes
            .iter()
            .any(|prefix| path.starts_with(normalize_path(prefix)))
    }

    fn is_long_running(&self, access: &AccessSnapshot, now: Instant) -> bool {
        now.saturating_duration_since(access.opened_at) > self.max_access_duration
    }
}

/// What one sweep found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Violations recorded during this sweep.
    pub flagged: Vec<ViolationRecord>,
    /// Paths whose windows were force-released.
    pub released: Vec<PathBuf>,
}

/// Watches open access windows.
pub struct SandboxMonitor {
    broker: Arc<CapabilityBroker>,
    violations: Arc<ViolationLog>,
    audit: Option<Arc<AuditLog>>,
    policy: MonitorPolicy,
    // Windows already reported as system-path accesses, by (path, opened_at).
    reported: Mutex<HashSet<(PathBuf, Instant)>>,
}

impl SandboxMonitor {
    pub fn new(
        broker: Arc<CapabilityBroker>,
        violations: Arc<ViolationLog>,
        policy: MonitorPolicy,
    ) -> Self {
        Self {
            broker,
            violations,
            audit: None,
            policy,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Record remediation in the audit trail.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn policy(&self) -> &MonitorPolicy {
        &self.policy
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.policy.interval.as_secs(),
            max_access_secs = self.policy.max_access_duration.as_secs(),
            "Sandbox monitor starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Sandbox monitor shutting down");
                return;
            }

            let report = self.sweep().await;
            if !report.flagged.is_empty() {
                info!(
                    flagged = report.flagged.len(),
                    released = report.released.len(),
                    "Sandbox monitor sweep found violations"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Sandbox monitor shutting down");
                    return;
                }
            }
        }
    }

    /// Inspect all open windows once and remediate.
    pub async fn sweep(&self) -> SweepReport {
        let accesses = self.broker.open_accesses().await;
        let now = Instant::now();
        let mut report = SweepReport::default();

        self.forget_closed(&accesses);

        for access in &accesses {
            if self.policy.is_system_path(&access.path) && self.first_report(access) {
                let record =
                    ViolationRecord::new(ViolationKind::SystemPathAccess, path_string(&access.path));
                self.record(&record);
                report.flagged.push(record);
            }

            if self.policy.is_long_running(access, now) {
                let Some(released) = self
                    .broker
                    .force_release_window(&access.path, access.opened_at)
                    .await
                else {
                    // Closed by its owner since the snapshot.
                    continue;
                };

                let open_for = now.saturating_duration_since(access.opened_at);
                warn!(
                    path = %access.path.display(),
                    open_secs = open_for.as_secs(),
                    released,
                    "Force-released long-running access"
                );
                let record =
                    ViolationRecord::new(ViolationKind::LongRunningAccess, path_string(&access.path));
                self.record(&record);
                if let Some(audit) = &self.audit {
                    audit.record(
                        AuditEvent::new(AuditEventType::AccessForceReleased)
                            .with_resource("path", path_string(&access.path))
                            .with_details(serde_json::json!({
                                "refcount": released,
                                "open_secs": open_for.as_secs(),
                                "opened_at": access.opened_at_utc,
                            })),
                    );
                }
                report.flagged.push(record);
                report.released.push(access.path.clone());
            }
        }

        debug!(
            open = accesses.len(),
            flagged = report.flagged.len(),
            released = report.released.len(),
            "Sandbox monitor sweep"
        );
        report
    }

    /// Whether no open window currently violates the policy.
    ///
    /// Evaluates the live windows without remediating anything.
    pub async fn is_healthy(&self) -> bool {
        let now = Instant::now();
        self.broker.open_accesses().await.iter().all(|access| {
            !self.policy.is_system_path(&access.path) && !self.policy.is_long_running(access, now)
        })
    }

    /// Recorded violations, oldest first.
    pub fn violations(&self) -> Vec<ViolationRecord> {
        self.violations.snapshot()
    }

    fn record(&self, record: &ViolationRecord) {
        self.violations.record(record.clone());
        if let Some(audit) = &self.audit {
            audit.record(
                AuditEvent::new(AuditEventType::PolicyViolation)
                    .with_resource("path", record.target.clone())
                    .with_details(serde_json::json!({ "kind": record.kind })),
            );
        }
    }

    fn reported(&self) -> std::sync::MutexGuard<'_, HashSet<(PathBuf, Instant)>> {
        self.reported
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn first_report(&self, access: &AccessSnapshot) -> bool {
        self.reported()
            .insert((access.path.clone(), access.opened_at))
    }

    fn forget_closed(&self, accesses: &[AccessSnapshot]) {
        let live: HashSet<(&Path, Instant)> = accesses
            .iter()
            .map(|a| (a.path.as_path(), a.opened_at))
            .collect();
        self.reported()
            .retain(|(path, opened_at)| live.contains(&(path.as_path(), *opened_at)));
    }
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}
