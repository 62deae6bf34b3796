// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Unix domain socket transport.
//!
//! The helper listens on a socket owned by the same user. On connect the
//! peer's credentials are checked against our own uid before the channel is
//! handed to the bridge.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use super::protocol::{decode_frame, encode_frame, HelperRequest, HelperResponse, MAX_FRAME_BYTES};
use super::transport::{HelperChannel, HelperTransport, TransportError};

/// Current process uid.
pub fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

/// Dials a helper over a Unix socket.
pub struct UnixSocketTransport {
    socket_path: PathBuf,
    endpoint: String,
    expected_uid: u32,
}

impl UnixSocketTransport {
    /// Transport for `socket_path`, accepting only peers running as us.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let socket_path = socket_path.into();
        Self {
            endpoint: socket_path.display().to_string(),
            socket_path,
            expected_uid: current_uid(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl HelperTransport for UnixSocketTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn HelperChannel>, TransportError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(map_io_error)?;

        let cred = stream.peer_cred().map_err(map_io_error)?;
        if cred.uid() != self.expected_uid {
            return Err(TransportError::PeerRejected(format!(
                "peer uid {} does not match {}",
                cred.uid(),
                self.expected_uid
            )));
        }

        Ok(Box::new(UnixSocketChannel::new(stream)))
    }
}

/// Newline-delimited JSON channel over one socket.
pub struct UnixSocketChannel {
    // One request in flight at a time.
    io: Mutex<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
}

impl UnixSocketChannel {
    pub fn new(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            io: Mutex::new((BufReader::new(read), write)),
        }
    }
}

#[async_trait]
impl HelperChannel for UnixSocketChannel {
    async fn call(&self, request: HelperRequest) -> Result<HelperResponse, TransportError> {
        let frame = encode_frame(&request).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;
        writer.write_all(&frame).await.map_err(map_io_error)?;
        writer.flush().await.map_err(map_io_error)?;

        let line = read_frame(reader).await?;
        decode_frame(&line).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

/// Read one newline-terminated frame, bounded by `MAX_FRAME_BYTES`.
pub(crate) async fn read_frame<R>(reader: &mut BufReader<R>) -> Result<String, TransportError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader)
        .take(MAX_FRAME_BYTES as u64)
        .read_until(b'\n', &mut buf)
        .await
        .map_err(map_io_error)?;

    if read == 0 {
        return Err(TransportError::Invalidated("peer closed the connection".to_string()));
    }
    if buf.last() != Some(&b'\n') {
        if read >= MAX_FRAME_BYTES {
            return Err(TransportError::Protocol(format!(
                "frame exceeds {MAX_FRAME_BYTES} bytes"
            )));
        }
        return Err(TransportError::Invalidated("peer closed mid-frame".to_string()));
    }

    String::from_utf8(buf).map_err(|_| TransportError::Protocol("frame is not UTF-8".to_string()))
}

/// Map socket errors onto the bridge's failure classes.
pub(crate) fn map_io_error(err: io::Error) -> TransportError {
    use io::ErrorKind::*;
    match err.kind() {
        NotFound | ConnectionRefused | ConnectionReset | ConnectionAborted | BrokenPipe
        | UnexpectedEof | NotConnected => TransportError::Invalidated(err.to_string()),
        _ => TransportError::Interrupted(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(map_io_error(refused), TransportError::Invalidated(_)));

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert!(matches!(map_io_error(timed_out), TransportError::Interrupted(_)));
    }

    #[tokio::test]
    async fn missing_socket_is_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let transport = UnixSocketTransport::new(dir.path().join("absent.sock"));

        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::Invalidated(_))));
    }

    #[tokio::test]
    async fn frames_are_bounded_and_closed_peers_detected() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let channel = UnixSocketChannel::new(client);

        let peer = tokio::spawn(async move {
            let mut reader = BufReader::new(&mut server);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            // Answer with a frame, then hang up before the second answer.
            server.write_all(b"{\"type\":\"ack\"}\n").await.unwrap();
            let mut reader = BufReader::new(&mut server);
            line.clear();
            reader.read_line(&mut line).await.unwrap();
        });

        let first = channel
            .call(HelperRequest::StopAccessing {
                path: PathBuf::from("/data"),
            })
            .await
            .unwrap();
        assert_eq!(first, HelperResponse::Ack);

        let second = channel.call(HelperRequest::ValidatePermissions).await;
        assert!(matches!(second, Err(TransportError::Invalidated(_))));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_frame_is_protocol_error() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let channel = UnixSocketChannel::new(client);

        let peer = tokio::spawn(async move {
            let mut reader = BufReader::new(&mut server);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            server.write_all(b"not json\n").await.unwrap();
        });

        let result = channel.call(HelperRequest::ValidatePermissions).await;
        assert!(matches!(result, Err(TransportError::Protocol(_))));
        peer.await.unwrap();
    }
}
