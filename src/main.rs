// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! `sandbox-broker [broker|helper]`
//!
//! The default role runs the broker: it restores persisted permissions,
//! starts the sandbox monitor and keeps the helper bridge ready until
//! Ctrl-C. The `helper` role serves the helper socket outside the sandbox.

use std::os::unix::fs::PermissionsExt;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sandbox_broker::ipc::{CommandHelper, HelperServer};
use sandbox_broker::logging;
use sandbox_broker::state::{local_capability_api, open_storage};
use sandbox_broker::{BrokerConfig, BrokerContext, BrokerError, CapabilityBroker};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("helper socket {path}: {source}")]
    Socket {
        path: String,
        source: std::io::Error,
    },

    #[error("unknown role {0:?}, expected `broker` or `helper`")]
    UnknownRole(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = BrokerConfig::from_env();
    logging::init(config.log_format);

    let role = std::env::args().nth(1);
    let result = match role.as_deref() {
        None | Some("broker") => run_broker(config).await,
        Some("helper") => run_helper(config).await,
        Some(other) => Err(StartupError::UnknownRole(other.to_string())),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Sandbox broker exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run_broker(config: BrokerConfig) -> Result<(), StartupError> {
    let context = BrokerContext::open(config)?;

    let summary = context.permissions.restore_all().await?;
    info!(
        restored = summary.restored,
        purged = summary.purged,
        "Persisted permissions restored"
    );

    let shutdown = CancellationToken::new();
    let monitor = tokio::spawn(context.monitor.clone().run(shutdown.clone()));

    info!(
        helper = %context.config.helper_socket.display(),
        "Sandbox broker ready; helper connects on first use"
    );
    wait_for_ctrl_c().await;

    shutdown.cancel();
    if let Err(e) = monitor.await {
        warn!(error = %e, "Sandbox monitor task failed");
    }
    context.bridge.disconnect();
    info!("Sandbox broker stopped");
    Ok(())
}

async fn run_helper(config: BrokerConfig) -> Result<(), StartupError> {
    let storage = open_storage(&config)?;
    let api = Arc::new(local_capability_api(&storage)?);
    let helper = CommandHelper::new(
        config.helper_identity.clone(),
        Arc::new(CapabilityBroker::new(api)),
        config.helper_programs.clone(),
    );

    let socket = config.helper_socket.clone();
    let socket_error = |source| StartupError::Socket {
        path: socket.display().to_string(),
        source,
    };
    match std::fs::remove_file(&socket) {
        Ok(()) => info!(path = %socket.display(), "Removed stale helper socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(socket_error(e)),
    }
    let listener = UnixListener::bind(&socket).map_err(socket_error)?;
    std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o600))
        .map_err(socket_error)?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(HelperServer::new(Arc::new(helper)).serve(listener, shutdown.clone()));
    info!(
        path = %socket.display(),
        programs = ?config.helper_programs,
        "Helper ready"
    );
    wait_for_ctrl_c().await;

    shutdown.cancel();
    if let Err(e) = server.await {
        warn!(error = %e, "Helper server task failed");
    }
    if let Err(e) = std::fs::remove_file(&socket) {
        warn!(error = %e, "Failed to remove helper socket");
    }
    info!("Helper stopped");
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C; shutting down");
    }
}
