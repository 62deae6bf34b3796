// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # IPC Bridge
//!
//! Delegates privileged command execution to a helper process running
//! outside the sandbox.
//!
//! - [`protocol`]: newline-delimited JSON frames and the handshake messages
//! - [`transport`]: the dial/call contract the bridge is written against
//! - [`unix`]: Unix socket transport with peer-uid checks
//! - [`bridge`]: the client-side connection state machine
//! - [`server`]: the helper-side accept loop and the stock command helper

pub mod bridge;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod unix;

pub use bridge::{BridgeSettings, ConnectionState, IpcBridge};
pub use protocol::{CommandOutput, HelperCommand};
pub use server::{CommandHelper, HelperServer, HelperService};
pub use transport::{HelperChannel, HelperTransport, TransportError};
pub use unix::UnixSocketTransport;
