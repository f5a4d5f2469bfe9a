//! Lockstep request/reply client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::envelope::{Request, Response};
use super::{Link, TcpLink};
use crate::error::{AppResult, FlexError};

/// Default per-call reply timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Most abandoned request ids remembered at once; the oldest is dropped first.
const MAX_ABANDONED: usize = 16;

struct Connection {
    link: Option<Box<dyn Link>>,
    /// Ids of requests abandoned on timeout whose replies may still arrive.
    abandoned: VecDeque<String>,
}

/// One connection to an instrument server.
///
/// Exchanges are strictly lockstep: the connection mutex is held from the
/// moment a request is written until its reply is resolved, so a second
/// request can never overtake the first on the wire, even when the client is
/// shared between tasks.
pub struct TransportClient {
    address: String,
    timeout: Duration,
    pacing: Duration,
    next_id: AtomicU64,
    connection: Mutex<Connection>,
}

impl TransportClient {
    /// Connect over TCP.
    ///
    /// `timeout` bounds both the connection attempt and every subsequent call.
    pub async fn connect(address: &str, timeout: Duration) -> AppResult<Self> {
        let link = TcpLink::connect(address, timeout).await?;
        info!(address, ?timeout, "Transport connected");
        Ok(Self::with_link(address, Box::new(link), timeout))
    }

    /// Build a client over an existing link.
    pub fn with_link(address: impl Into<String>, link: Box<dyn Link>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            pacing: Duration::ZERO,
            next_id: AtomicU64::new(1),
            connection: Mutex::new(Connection {
                link: Some(link),
                abandoned: VecDeque::new(),
            }),
        }
    }

    /// Pause for `pacing` after every reply before releasing the connection.
    ///
    /// Some instrument servers drop requests that arrive too soon after a reply.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Endpoint this client was created for.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current per-call reply timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the per-call reply timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        debug!(address = %self.address, ?timeout, "Transport timeout changed");
        self.timeout = timeout;
    }

    /// Send one request and wait for its reply, using the client timeout.
    pub async fn call(&self, method: &str, params: Value) -> AppResult<Value> {
        self.call_with_timeout(method, params, self.timeout).await
    }

    /// Send one request and wait at most `timeout` for its reply.
    ///
    /// Errors: [`FlexError::Timeout`] if no reply arrives in time,
    /// [`FlexError::Protocol`] for malformed replies, [`FlexError::Remote`]
    /// when the server answers with an error, [`FlexError::Connection`] if the
    /// connection is closed or broken. Nothing is retried.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> AppResult<Value> {
        let mut guard = self.connection.lock().await;
        let Connection { link, abandoned } = &mut *guard;
        let link = link.as_mut().ok_or_else(|| {
            FlexError::Connection(format!("connection to {} is closed", self.address))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = Request::new(method, &params, &id).to_frame()?;
        debug!(method, id = %id, "Sending request");
        link.send(&frame).await?;

        let deadline = Instant::now() + timeout;
        let result = loop {
            let raw = match tokio::time::timeout_at(deadline, link.recv()).await {
                Ok(raw) => raw?,
                Err(_) => {
                    warn!(method, id = %id, ?timeout, "No reply before timeout");
                    if abandoned.len() == MAX_ABANDONED {
                        abandoned.pop_front();
                    }
                    abandoned.push_back(id);
                    return Err(FlexError::Timeout {
                        method: method.to_string(),
                        timeout,
                    });
                }
            };

            let response = Response::parse(&raw)?;
            match response.id.as_deref() {
                None => break response.into_result(),
                Some(reply_id) if reply_id == id => {
                    // Replies arrive in request order, so older ids can no longer show up.
                    abandoned.clear();
                    break response.into_result();
                }
                Some(reply_id) if forget(abandoned, reply_id) => {
                    debug!(method, stale_id = reply_id, "Discarding late reply");
                }
                Some(reply_id) => {
                    return Err(FlexError::Protocol(format!(
                        "reply id {reply_id} does not match request id {id} for '{method}'"
                    )))
                }
            }
        };

        match &result {
            Ok(value) => debug!(method, id = %id, reply = %value, "Reply received"),
            Err(e) => debug!(method, id = %id, error = %e, "Error reply received"),
        }

        if !self.pacing.is_zero() {
            tokio::time::sleep(self.pacing).await;
        }
        result
    }

    /// Whether `close` has been called.
    pub async fn is_closed(&self) -> bool {
        self.connection.lock().await.link.is_none()
    }

    /// Release the connection. Safe to call any number of times.
    pub async fn close(&self) -> AppResult<()> {
        let mut guard = self.connection.lock().await;
        if let Some(mut link) = guard.link.take() {
            info!(address = %self.address, peer = %link.peer(), "Closing transport");
            guard.abandoned.clear();
            link.close().await?;
        }
        Ok(())
    }
}

fn forget(abandoned: &mut VecDeque<String>, id: &str) -> bool {
    match abandoned.iter().position(|known| known == id) {
        Some(index) => {
            abandoned.remove(index);
            true
        }
        None => false,
    }
}
