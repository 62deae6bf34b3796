// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Helper side of the IPC channel.
//!
//! [`HelperServer`] accepts connections on a Unix socket, enforces the
//! handshake and dispatches requests to a [`HelperService`].
//! [`CommandHelper`] is the stock service: it runs allow-listed programs,
//! opening an access window for the duration of the run when the broker
//! passes a capability token.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{
    decode_frame, encode_frame, CommandOutput, HelperCommand, HelperRequest, HelperResponse,
    PROTOCOL_VERSION,
};
use super::transport::TransportError;
use super::unix::{current_uid, read_frame};
use crate::capability::{CapabilityBroker, CapabilityToken};

/// Operations a helper exposes to the broker.
#[async_trait]
pub trait HelperService: Send + Sync {
    /// Identity presented in the handshake.
    fn identity(&self) -> &str;

    async fn execute(
        &self,
        command: HelperCommand,
        token: Option<CapabilityToken>,
    ) -> Result<CommandOutput, String>;

    async fn start_accessing(&self, path: &Path) -> bool;

    async fn stop_accessing(&self, path: &Path);

    async fn validate_permissions(&self) -> bool;
}

/// Socket server for a [`HelperService`].
pub struct HelperServer<S> {
    service: Arc<S>,
    expected_uid: u32,
}

impl<S: HelperService + 'static> HelperServer<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            expected_uid: current_uid(),
        }
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(self, listener: UnixListener, shutdown: CancellationToken) {
        info!(identity = %self.service.identity(), "Helper listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Helper shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if !self.peer_allowed(&stream) {
                            continue;
                        }
                        let service = Arc::clone(&self.service);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(service, stream, shutdown).await {
                                debug!(error = %e, "Broker connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept broker connection");
                    }
                },
            }
        }
    }

    fn peer_allowed(&self, stream: &UnixStream) -> bool {
        match stream.peer_cred() {
            Ok(cred) if cred.uid() == self.expected_uid => true,
            Ok(cred) => {
                warn!(peer_uid = cred.uid(), "Rejected connection from foreign uid");
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not read peer credentials");
                false
            }
        }
    }
}

async fn handle_connection<S: HelperService>(
    service: Arc<S>,
    stream: UnixStream,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut greeted = false;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = read_frame(&mut reader) => line?,
        };

        let response = match decode_frame::<HelperRequest>(&line) {
            Ok(request) if !greeted => {
                let (response, accepted) = greet(service.identity(), request);
                greeted = accepted;
                response
            }
            Ok(request) => dispatch(service.as_ref(), request).await,
            Err(e) => HelperResponse::Error {
                reason: format!("malformed request: {e}"),
            },
        };

        let closing = matches!(response, HelperResponse::HelloNack { .. });
        let frame = encode_frame(&response).map_err(|e| TransportError::Protocol(e.to_string()))?;
        write
            .write_all(&frame)
            .await
            .map_err(super::unix::map_io_error)?;
        if closing {
            return Ok(());
        }
    }
}

fn greet(identity: &str, request: HelperRequest) -> (HelperResponse, bool) {
    match request {
        HelperRequest::Hello {
            protocol_version,
            client_info,
            nonce,
        } if protocol_version == PROTOCOL_VERSION => {
            info!(client = %client_info, "Broker connected");
            (
                HelperResponse::HelloAck {
                    protocol_version: PROTOCOL_VERSION,
                    helper_identity: identity.to_string(),
                    nonce,
                },
                true,
            )
        }
        HelperRequest::Hello {
            protocol_version, ..
        } => (
            HelperResponse::HelloNack {
                reason: format!(
                    "unsupported protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
                ),
            },
            false,
        ),
        _ => (
            HelperResponse::HelloNack {
                reason: "handshake required".to_string(),
            },
            false,
        ),
    }
}

async fn dispatch<S: HelperService + ?Sized>(service: &S, request: HelperRequest) -> HelperResponse {
    match request {
        HelperRequest::Hello { .. } => HelperResponse::Error {
            reason: "already connected".to_string(),
        },
        HelperRequest::Execute {
            request_id,
            command,
            token,
        } => match service.execute(command, token).await {
            Ok(output) => HelperResponse::Output { request_id, output },
            Err(reason) => HelperResponse::Failed { request_id, reason },
        },
        HelperRequest::StartAccessing { path } => HelperResponse::Access {
            granted: service.start_accessing(&path).await,
        },
        HelperRequest::StopAccessing { path } => {
            service.stop_accessing(&path).await;
            HelperResponse::Ack
        }
        HelperRequest::ValidatePermissions => HelperResponse::Valid {
            ok: service.validate_permissions().await,
        },
    }
}

/// Helper service that runs allow-listed programs.
pub struct CommandHelper {
    identity: String,
    broker: Arc<CapabilityBroker>,
    allowed_programs: Vec<String>,
}

impl CommandHelper {
    pub fn new(
        identity: impl Into<String>,
        broker: Arc<CapabilityBroker>,
        allowed_programs: Vec<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            broker,
            allowed_programs,
        }
    }

    /// Exact match only: a bare entry is resolved through `PATH` at spawn
    /// time, an absolute entry names one binary.
    fn program_allowed(&self, program: &str) -> bool {
        self.allowed_programs.iter().any(|p| p == program)
    }

    async fn run(&self, command: &HelperCommand) -> Result<CommandOutput, String> {
        let mut process = tokio::process::Command::new(&command.program);
        process
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            process.current_dir(dir);
        }

        let output = process
            .output()
            .await
            .map_err(|e| format!("failed to launch {}: {e}", command.program))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl HelperService for CommandHelper {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn execute(
        &self,
        command: HelperCommand,
        token: Option<CapabilityToken>,
    ) -> Result<CommandOutput, String> {
        if !self.program_allowed(&command.program) {
            warn!(program = %command.program, "Refused program outside the allow-list");
            return Err(format!("program {} is not allowed", command.program));
        }

        let scoped: Option<PathBuf> = match &token {
            Some(token) => {
                let resolution = self
                    .broker
                    .resolve_token(token)
                    .await
                    .map_err(|e| e.to_string())?;
                if resolution.is_stale {
                    warn!(path = %resolution.path.display(), "Refused stale capability token");
                    return Err(format!(
                        "token stale for {}: refresh and resend",
                        resolution.path.display()
                    ));
                }
                if !self.broker.start_accessing(&resolution.path).await {
                    return Err(format!(
                        "access to {} was refused",
                        resolution.path.display()
                    ));
                }
                Some(resolution.path)
            }
            None => None,
        };

        debug!(program = %command.program, args = ?command.args, "Running command");
        let result = self.run(&command).await;

        if let Some(path) = scoped {
            self.broker.stop_accessing(&path).await;
        }
        result
    }

    async fn start_accessing(&self, path: &Path) -> bool {
        self.broker.start_accessing(path).await
    }

    async fn stop_accessing(&self, path: &Path) {
        self.broker.stop_accessing(path).await
    }

    async fn validate_permissions(&self) -> bool {
        for access in self.broker.open_accesses().await {
            if tokio::fs::metadata(&access.path).await.is_err() {
                warn!(path = %access.path.display(), "Open access window points at a missing location");
                return false;
            }
        }
        true
    }
}
