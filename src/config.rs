// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the broker. Configuration is loaded from the environment at
//! startup; unset or unparsable values fall back to the defaults below.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `BROKER_DATA_DIR` | Application-private data directory | `$HOME/.local/share/sandbox-broker` |
//! | `BROKER_HELPER_SOCKET` | Helper Unix socket path | `<data dir>/helper.sock` |
//! | `BROKER_HELPER_IDENTITY` | Identity the helper must present | `sandbox-broker-helper` |
//! | `BROKER_ALLOWED_ENDPOINTS` | Comma-separated helper endpoints the bridge may dial | helper socket only |
//! | `BROKER_HELPER_PROGRAMS` | Comma-separated programs the helper may run | `restic` |
//! | `BROKER_CONNECT_TIMEOUT_SECS` | Handshake timeout | `5` |
//! | `BROKER_REQUEST_TIMEOUT_SECS` | Per-request timeout | `30` |
//! | `BROKER_MONITOR_INTERVAL_SECS` | Sandbox monitor sweep interval | `60` |
//! | `BROKER_MAX_ACCESS_SECS` | Longest allowed access window | `300` |
//! | `BROKER_DENIED_PREFIXES` | Comma-separated denied system prefixes | see [`crate::monitor`] |
//! | `BROKER_VIOLATION_CAPACITY` | Violation records retained | `100` |
//! | `BROKER_SECRET_SERVICE` | Secret-store service name for credentials | `sandbox-broker.repository` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::credentials::DEFAULT_SECRET_SERVICE;
use crate::ipc::bridge::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::logging::LogFormat;
use crate::monitor::MonitorPolicy;
use crate::storage::StoragePaths;
use crate::violations::DEFAULT_CAPACITY;

/// Environment variable name for the private data directory.
pub const DATA_DIR_ENV: &str = "BROKER_DATA_DIR";

/// Environment variable name for the helper socket path.
pub const HELPER_SOCKET_ENV: &str = "BROKER_HELPER_SOCKET";

/// Environment variable name for the expected helper identity.
///
/// The bridge refuses a helper whose handshake presents any other identity.
pub const HELPER_IDENTITY_ENV: &str = "BROKER_HELPER_IDENTITY";

/// Environment variable name for the helper endpoint allow-list.
pub const ALLOWED_ENDPOINTS_ENV: &str = "BROKER_ALLOWED_ENDPOINTS";

/// Environment variable name for the programs the helper may run.
pub const HELPER_PROGRAMS_ENV: &str = "BROKER_HELPER_PROGRAMS";

pub const CONNECT_TIMEOUT_ENV: &str = "BROKER_CONNECT_TIMEOUT_SECS";
pub const REQUEST_TIMEOUT_ENV: &str = "BROKER_REQUEST_TIMEOUT_SECS";
pub const MONITOR_INTERVAL_ENV: &str = "BROKER_MONITOR_INTERVAL_SECS";
pub const MAX_ACCESS_ENV: &str = "BROKER_MAX_ACCESS_SECS";
pub const DENIED_PREFIXES_ENV: &str = "BROKER_DENIED_PREFIXES";
pub const VIOLATION_CAPACITY_ENV: &str = "BROKER_VIOLATION_CAPACITY";
pub const SECRET_SERVICE_ENV: &str = "BROKER_SECRET_SERVICE";

/// Environment variable name for the log output format.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Default helper identity.
pub const DEFAULT_HELPER_IDENTITY: &str = "sandbox-broker-helper";

/// Default helper socket file name inside the data directory.
pub const DEFAULT_SOCKET_NAME: &str = "helper.sock";

/// Default programs the helper may run.
pub const DEFAULT_HELPER_PROGRAMS: &[&str] = &["restic"];

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub data_dir: PathBuf,
    pub helper_socket: PathBuf,
    pub helper_identity: String,
    pub allowed_endpoints: Vec<String>,
    pub helper_programs: Vec<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub monitor: MonitorPolicy,
    pub violation_capacity: usize,
    pub secret_service: String,
    pub log_format: LogFormat,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let data_dir = StoragePaths::default().root().to_path_buf();
        let helper_socket = data_dir.join(DEFAULT_SOCKET_NAME);
        Self {
            allowed_endpoints: vec![helper_socket.display().to_string()],
            data_dir,
            helper_socket,
            helper_identity: DEFAULT_HELPER_IDENTITY.to_string(),
            helper_programs: DEFAULT_HELPER_PROGRAMS.iter().map(|p| p.to_string()).collect(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            monitor: MonitorPolicy::default(),
            violation_capacity: DEFAULT_CAPACITY,
            secret_service: DEFAULT_SECRET_SERVICE.to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let data_dir = get(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let helper_socket = get(HELPER_SOCKET_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(DEFAULT_SOCKET_NAME));
        let allowed_endpoints = get(ALLOWED_ENDPOINTS_ENV)
            .map(|v| split_list(&v))
            .unwrap_or_else(|| vec![helper_socket.display().to_string()]);

        let monitor = MonitorPolicy {
            interval: secs(&get, MONITOR_INTERVAL_ENV, defaults.monitor.interval),
            max_access_duration: secs(&get, MAX_ACCESS_ENV, defaults.monitor.max_access_duration),
            denied_prefixes: get(DENIED_PREFIXES_ENV)
                .map(|v| split_list(&v).into_iter().map(PathBuf::from).collect())
                .unwrap_or(defaults.monitor.denied_prefixes),
        };

        Self {
            data_dir,
            helper_socket,
            helper_identity: get(HELPER_IDENTITY_ENV).unwrap_or(defaults.helper_identity),
            allowed_endpoints,
            helper_programs: get(HELPER_PROGRAMS_ENV)
                .map(|v| split_list(&v))
                .unwrap_or(defaults.helper_programs),
            connect_timeout: secs(&get, CONNECT_TIMEOUT_ENV, defaults.connect_timeout),
            request_timeout: secs(&get, REQUEST_TIMEOUT_ENV, defaults.request_timeout),
            monitor,
            violation_capacity: number(&get, VIOLATION_CAPACITY_ENV, defaults.violation_capacity),
            secret_service: get(SECRET_SERVICE_ENV).unwrap_or(defaults.secret_service),
            log_format: get(LOG_FORMAT_ENV)
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.log_format),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn number<G>(get: &G, name: &str, default: usize) -> usize
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(value) if value > 0 => value,
            _ => {
                warn!(variable = name, value = %raw, default, "Invalid value, using default");
                default
            }
        },
        None => default,
    }
}

fn secs<G>(get: &G, name: &str, default: Duration) -> Duration
where
    G: Fn(&str) -> Option<String>,
{
    Duration::from_secs(number(get, name, default.as_secs() as usize) as u64)
}
