// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Sandbox Broker - Capability & Credential Broker
//!
//! Lets a sandboxed application hand an out-of-process backup helper access
//! to user-selected locations, and keeps repository passwords apart from
//! their metadata.
//!
//! ## Modules
//!
//! - `capability` - Capability tokens and per-path access refcounting
//! - `permissions` - Persisted tokens, recovery and revocation
//! - `secrets` / `credentials` - Secret vault and repository credentials
//! - `monitor` - Sandbox-policy monitoring and remediation
//! - `ipc` - Helper connection state machine, protocol and helper server
//! - `platform` - OS contracts and the shipped backends
//! - `storage` - Application-private storage (atomic JSON, audit trail)

pub mod capability;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod monitor;
pub mod permissions;
pub mod platform;
pub mod secrets;
pub mod state;
pub mod storage;
pub mod violations;

#[cfg(test)]
mod testing;

pub use capability::{CapabilityBroker, CapabilityToken};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use state::BrokerContext;
