//! TCP link: one JSON envelope per `\n`-terminated line.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{socket_address, Link};
use crate::error::{AppResult, FlexError};

/// Line-framed TCP connection to an instrument server.
pub struct TcpLink {
    stream: TcpStream,
    peer: String,
    /// Bytes read past the last complete frame.
    pending: Vec<u8>,
}

impl TcpLink {
    /// Open a connection, bounded by `timeout`.
    pub async fn connect(address: &str, timeout: Duration) -> AppResult<Self> {
        let target = socket_address(address)?;
        debug!(address, "Connecting");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| {
                FlexError::Connection(format!("connecting to {address} timed out after {timeout:?}"))
            })?
            .map_err(|e| FlexError::Connection(format!("cannot reach {address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| FlexError::Connection(format!("cannot configure socket for {address}: {e}")))?;

        Ok(Self::from_stream(stream, address.to_string()))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            pending: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn send(&mut self, frame: &str) -> AppResult<()> {
        let mut bytes = Vec::with_capacity(frame.len() + 1);
        bytes.extend_from_slice(frame.as_bytes());
        bytes.push(b'\n');
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| FlexError::Connection(format!("write to {} failed: {e}", self.peer)))?;
        trace!(peer = %self.peer, bytes = bytes.len(), "Frame written");
        Ok(())
    }

    async fn recv(&mut self) -> AppResult<String> {
        loop {
            if let Some(line) = self.take_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return String::from_utf8(line).map_err(|_| {
                    FlexError::Protocol(format!("reply from {} is not valid UTF-8", self.peer))
                });
            }

            // `read` is cancel-safe; bytes land in `pending` in the same poll.
            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| FlexError::Connection(format!("read from {} failed: {e}", self.peer)))?;
            if n == 0 {
                return Err(FlexError::Connection(format!(
                    "connection closed by {}",
                    self.peer
                )));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Shutdown after close failed");
        }
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
