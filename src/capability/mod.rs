// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Capability Broker
//!
//! Creates, resolves and refreshes capability tokens, and reference-counts
//! access windows per path.
//!
//! ## Access Refcounting
//!
//! Each path with an open window has one slot holding its refcount. The OS
//! `begin_access` call is issued only on the 0→1 transition and `end_access`
//! only on the 1→0 transition, so nested and concurrent callers share one
//! OS-level window.
//!
//! Operations on the same path are serialized by the slot's async mutex,
//! which is held across the OS call so two racing openers issue exactly one
//! `begin_access`. Different paths use different slots and proceed in
//! parallel. The slot map itself is guarded by a short synchronous lock that
//! is never held across an await.
//!
//! A slot is retired and removed from the map when its refcount returns to
//! zero. A caller that acquired a retired slot retries against the map.
//!
//! ## Path Keys
//!
//! Slots are keyed by [`normalize_path`]. The key is never handed to the OS:
//! `begin_access` and `end_access` both receive the path the opening caller
//! passed, byte for byte.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::error::{BrokerError, BrokerResult};
use crate::platform::{CapabilityApi, Resolution};

pub mod token;

pub use token::CapabilityToken;

/// Normalize a path for use as a lookup key.
///
/// Unicode is NFC-composed and `.`/`..` components are resolved lexically
/// (`..` never climbs above the root). Symlinks are not followed. The result
/// identifies a location for bookkeeping only; filesystem calls take the
/// caller's original path.
pub fn normalize_path(path: &Path) -> PathBuf {
    let composed = match path.to_str() {
        Some(s) => PathBuf::from(s.nfc().collect::<String>()),
        None => path.to_path_buf(),
    };

    let mut resolved = PathBuf::new();
    for component in composed.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match resolved.components().next_back() {
                Some(Component::Normal(_)) => {
                    resolved.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => resolved.push(".."),
            },
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

/// Point-in-time view of one open access window.
#[derive(Debug, Clone)]
pub struct AccessSnapshot {
    pub path: PathBuf,
    pub refcount: usize,
    /// Monotonic open time, used for duration checks.
    pub opened_at: Instant,
    /// Wall-clock open time, used for reporting.
    pub opened_at_utc: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SlotState {
    refcount: usize,
    opened: Option<(Instant, DateTime<Utc>)>,
    /// Path the window was opened with; `end_access` gets the same one.
    os_path: Option<PathBuf>,
    retired: bool,
}

#[derive(Debug, Default)]
struct AccessSlot {
    state: tokio::sync::Mutex<SlotState>,
}

/// Broker over the OS capability API.
pub struct CapabilityBroker {
    api: Arc<dyn CapabilityApi>,
    slots: Mutex<HashMap<PathBuf, Arc<AccessSlot>>>,
}

impl CapabilityBroker {
    /// Create a broker over the given capability API.
    pub fn new(api: Arc<dyn CapabilityApi>) -> Self {
        Self {
            api,
            slots: Mutex::new(HashMap::new()),
        }
    }

    // ========== Tokens ==========

    /// Request a read-scoped token for `path`.
    pub async fn create_token(&self, path: &Path) -> BrokerResult<CapabilityToken> {
        let bytes = self
            .api
            .create_token(path, true)
            .await
            .map_err(|e| BrokerError::TokenCreationFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        debug!(path = %path.display(), bytes = bytes.len(), "Created capability token");
        Ok(CapabilityToken::from_bytes(bytes))
    }

    /// Resolve a token back to a path.
    ///
    /// Staleness is reported in the result, not as an error: callers must
    /// refresh a stale token rather than retry it.
    pub async fn resolve_token(&self, token: &CapabilityToken) -> BrokerResult<Resolution> {
        let resolution = self
            .api
            .resolve(token.as_bytes())
            .await
            .map_err(|e| BrokerError::TokenResolutionFailed(e.to_string()))?;
        if resolution.is_stale {
            debug!(path = %resolution.path.display(), "Resolved stale capability token");
        }
        Ok(resolution)
    }

    /// Re-derive a token for a path whose previous token went stale.
    pub async fn refresh_token(&self, path: &Path) -> BrokerResult<CapabilityToken> {
        let bytes = self
            .api
            .create_token(path, true)
            .await
            .map_err(|e| BrokerError::TokenRefreshFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        info!(path = %path.display(), "Refreshed stale capability token");
        Ok(CapabilityToken::from_bytes(bytes))
    }

    // ========== Access Windows ==========

    /// Open (or join) the access window for `path`.
    ///
    /// Returns whether access is granted. A refused 0→1 transition leaves no
    /// refcount behind, so the caller must not call `stop_accessing` for it.
    pub async fn start_accessing(&self, path: &Path) -> bool {
        let key = normalize_path(path);
        loop {
            let slot = self.slot_or_insert(&key);
            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }

            if state.refcount > 0 {
                state.refcount += 1;
                debug!(path = %key.display(), refcount = state.refcount, "Joined access window");
                return true;
            }

            let granted = self.api.begin_access(path).await;
            if granted {
                state.refcount = 1;
                state.opened = Some((Instant::now(), Utc::now()));
                state.os_path = Some(path.to_path_buf());
                info!(path = %path.display(), "Opened access window");
            } else {
                state.retired = true;
                self.remove_slot(&key, &slot);
                warn!(path = %path.display(), "Access refused by capability API");
            }
            return granted;
        }
    }

    /// Leave the access window for `path`.
    ///
    /// Unbalanced calls (refcount already zero, unknown path) are a silent
    /// no-op and never issue an extra `end_access`.
    pub async fn stop_accessing(&self, path: &Path) {
        let key = normalize_path(path);
        loop {
            let Some(slot) = self.existing_slot(&key) else {
                return;
            };
            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }
            if state.refcount == 0 {
                return;
            }

            state.refcount -= 1;
            if state.refcount == 0 {
                self.close(&key, &slot, &mut state).await;
                info!(path = %key.display(), "Closed access window");
            } else {
                debug!(path = %key.display(), refcount = state.refcount, "Left access window");
            }
            return;
        }
    }

    /// Drop every reference to `path` and close its window.
    ///
    /// Returns the refcount that was released, or `None` if no window was
    /// open. Callers still holding a reference find it gone; their later
    /// `stop_accessing` is a no-op.
    pub async fn force_release(&self, path: &Path) -> Option<usize> {
        self.release(path, None).await
    }

    /// Like [`force_release`](Self::force_release), but only if the window
    /// open on `path` is the one opened at `opened_at`.
    ///
    /// A window closed and reopened since a snapshot was taken is left alone.
    pub async fn force_release_window(&self, path: &Path, opened_at: Instant) -> Option<usize> {
        self.release(path, Some(opened_at)).await
    }

    async fn release(&self, path: &Path, expected: Option<Instant>) -> Option<usize> {
        let key = normalize_path(path);
        loop {
            let slot = self.existing_slot(&key)?;
            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }
            if state.refcount == 0 {
                return None;
            }
            if let Some(expected) = expected {
                if state.opened.map(|(at, _)| at) != Some(expected) {
                    return None;
                }
            }

            let released = state.refcount;
            state.refcount = 0;
            self.close(&key, &slot, &mut state).await;
            warn!(path = %key.display(), released, "Force-released access window");
            return Some(released);
        }
    }

    /// Current refcount for `path` (zero when no window is open).
    pub async fn refcount(&self, path: &Path) -> usize {
        let key = normalize_path(path);
        match self.existing_slot(&key) {
            Some(slot) => {
                let state = slot.state.lock().await;
                if state.retired {
                    0
                } else {
                    state.refcount
                }
            }
            None => 0,
        }
    }

    /// Snapshot of all open access windows.
    pub async fn open_accesses(&self) -> Vec<AccessSnapshot> {
        let slots: Vec<(PathBuf, Arc<AccessSlot>)> = {
            let map = self.lock_slots();
            map.iter()
                .map(|(path, slot)| (path.clone(), Arc::clone(slot)))
                .collect()
        };

        let mut snapshots = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            let state = slot.state.lock().await;
            if state.retired || state.refcount == 0 {
                continue;
            }
            if let Some((opened_at, opened_at_utc)) = state.opened {
                snapshots.push(AccessSnapshot {
                    path: state.os_path.clone().unwrap_or(key),
                    refcount: state.refcount,
                    opened_at,
                    opened_at_utc,
                });
            }
        }
        snapshots
    }

    async fn close(&self, key: &Path, slot: &Arc<AccessSlot>, state: &mut SlotState) {
        match state.os_path.take() {
            Some(os_path) => self.api.end_access(&os_path).await,
            None => self.api.end_access(key).await,
        }
        state.opened = None;
        state.retired = true;
        self.remove_slot(key, slot);
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<AccessSlot>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot_or_insert(&self, key: &Path) -> Arc<AccessSlot> {
        let mut map = self.lock_slots();
        Arc::clone(map.entry(key.to_path_buf()).or_default())
    }

    fn existing_slot(&self, key: &Path) -> Option<Arc<AccessSlot>> {
        self.lock_slots().get(key).cloned()
    }

    fn remove_slot(&self, key: &Path, slot: &Arc<AccessSlot>) {
        let mut map = self.lock_slots();
        if map.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            map.remove(key);
        }
    }
}
