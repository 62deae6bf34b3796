// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Helper wire protocol.
//!
//! Frames are single-line JSON objects terminated by `\n`, tagged by `type`.
//!
//! ```text
//! Broker                                     Helper
//!   |  -- hello { version, client_info, nonce } -->  |
//!   |  <-- hello_ack { version, identity, nonce } -- |
//!   |      OR hello_nack { reason }                  |
//!   |  -- execute { request_id, command, token } --> |
//!   |  <-- output { request_id, output }          -- |
//!   |      OR failed { request_id, reason }          |
//! ```
//!
//! The handshake must complete before any other request is served.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::capability::CapabilityToken;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame, including the trailing newline.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// A command for the helper to run outside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl HelperCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Result of a command run by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Requests sent by the broker to the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperRequest {
    Hello {
        protocol_version: u32,
        client_info: String,
        nonce: String,
    },
    Execute {
        request_id: String,
        command: HelperCommand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<CapabilityToken>,
    },
    StartAccessing {
        path: PathBuf,
    },
    StopAccessing {
        path: PathBuf,
    },
    ValidatePermissions,
}

/// Responses sent by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperResponse {
    HelloAck {
        protocol_version: u32,
        helper_identity: String,
        nonce: String,
    },
    HelloNack {
        reason: String,
    },
    Output {
        request_id: String,
        output: CommandOutput,
    },
    Failed {
        request_id: String,
        reason: String,
    },
    Access {
        granted: bool,
    },
    Ack,
    Valid {
        ok: bool,
    },
    Error {
        reason: String,
    },
}

/// Encode a message as one newline-terminated frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one frame (with or without its trailing newline).
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end_matches(&['\n', '\r'][..]))
}
