//! Request/reply transport to instrument servers.
//!
//! The transport knows nothing about devices. [`TransportClient`] owns one
//! connection and performs one exchange at a time; a [`Link`] moves frames and
//! nothing else.
//!
//! ```text
//! TransportClient ── envelope, ids, timeout, lockstep
//!        │
//!   dyn Link ─────── framing only
//!    ├─ TcpLink      newline-delimited JSON over TCP
//!    └─ MockLink     in-process simulated device
//! ```

use async_trait::async_trait;

use crate::error::{AppResult, FlexError};

pub mod client;
pub mod envelope;
pub mod mock;
pub mod tcp;

pub use client::TransportClient;
pub use envelope::{no_params, Request, Response};
pub use mock::{Fault, MockHandle, MockLink};
pub use tcp::TcpLink;

/// Frame-level I/O for one connection.
///
/// Implementations must make `recv` cancel-safe: the client wraps it in a
/// timeout, and a reply arriving after that timeout must still be delivered
/// intact on the next `recv`.
#[async_trait]
pub trait Link: Send {
    /// Write one complete frame.
    async fn send(&mut self, frame: &str) -> AppResult<()>;

    /// Read the next complete frame.
    async fn recv(&mut self) -> AppResult<String>;

    /// Release the underlying resource.
    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}

/// Resolve an endpoint address such as `tcp://localhost:29170` to `host:port`.
///
/// The `tcp://` scheme is optional; any other scheme is rejected.
pub fn socket_address(address: &str) -> AppResult<&str> {
    let host_port = match address.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(FlexError::Connection(format!(
                "unsupported transport scheme '{scheme}' in '{address}'"
            )))
        }
        None => address,
    };

    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(host_port),
        _ => Err(FlexError::Connection(format!(
            "address '{address}' is not of the form tcp://host:port"
        ))),
    }
}
