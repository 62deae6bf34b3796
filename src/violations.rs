// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Sandbox-policy violation records.
//!
//! Violations are kept in a capped in-memory ring: the newest `capacity`
//! records are retained and older ones are dropped. The ring is shared by
//! the sandbox monitor (access violations) and the IPC bridge (unauthorized
//! helper endpoints).

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of records retained.
pub const DEFAULT_CAPACITY: usize = 100;

/// Kind of policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    /// An access window stayed open longer than the policy allows.
    LongRunningAccess,
    /// An access window was opened under a denied system prefix.
    SystemPathAccess,
    /// A connection was attempted to a helper endpoint not on the allow-list.
    UnauthorizedIpcTarget,
}

/// One detected violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub kind: ViolationKind,
    /// Path or endpoint the violation concerns.
    pub target: String,
    pub detected_at: DateTime<Utc>,
}

impl ViolationRecord {
    pub fn new(kind: ViolationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            detected_at: Utc::now(),
        }
    }
}

struct Ring {
    entries: VecDeque<ViolationRecord>,
    total: u64,
}

/// Append-only capped ring of violations.
pub struct ViolationLog {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl Default for ViolationLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ViolationLog {
    /// Create a ring retaining at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                total: 0,
            }),
        }
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record, evicting the oldest when full.
    pub fn record(&self, record: ViolationRecord) {
        tracing::warn!(
            kind = ?record.kind,
            target = %record.target,
            "Sandbox policy violation"
        );
        let mut ring = self.ring();
        if ring.entries.len() == self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(record);
        ring.total += 1;
    }

    /// Retained records, oldest first.
    pub fn snapshot(&self) -> Vec<ViolationRecord> {
        self.ring().entries.iter().cloned().collect()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.ring().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records ever appended, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.ring().total
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_newest_entries() {
        let log = ViolationLog::new(3);
        for i in 0..5 {
            log.record(ViolationRecord::new(
                ViolationKind::SystemPathAccess,
                format!("/System/{i}"),
            ));
        }

        let targets: Vec<_> = log.snapshot().into_iter().map(|r| r.target).collect();
        assert_eq!(targets, vec!["/System/2", "/System/3", "/System/4"]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.total_recorded(), 5);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let log = ViolationLog::new(0);
        assert_eq!(log.capacity(), 1);
        log.record(ViolationRecord::new(ViolationKind::LongRunningAccess, "/a"));
        log.record(ViolationRecord::new(ViolationKind::LongRunningAccess, "/b"));
        assert_eq!(log.snapshot()[0].target, "/b");
    }

    #[test]
    fn kinds_serialize_kebab_case() {
        let json = serde_json::to_string(&ViolationKind::UnauthorizedIpcTarget).unwrap();
        assert_eq!(json, "\"unauthorized-ipc-target\"");
    }
}
