//! In-process link for testing without a server.
//!
//! [`MockLink`] feeds each request to a simulated device and queues the
//! reply. It provides:
//! - Call logging for test verification
//! - Fault injection (silence, garbage, delayed replies)
//! - In-flight tracking to check lockstep behaviour
//!
//! # Example
//!
//! ```
//! use flex_daq::sim::SimulatedAmplifier;
//! use flex_daq::transport::{MockLink, TransportClient};
//! use std::time::Duration;
//!
//! let link = MockLink::new(SimulatedAmplifier::new());
//! let handle = link.handle();
//! let client = TransportClient::with_link("mock://kh7008", Box::new(link), Duration::from_secs(1));
//! assert!(handle.call_log().is_empty());
//! # drop(client);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::Link;
use crate::error::{AppResult, FlexError};
use crate::sim::DeviceHandler;

/// A misbehaviour applied to the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Never answer.
    Silence,
    /// Answer with this frame instead of a valid envelope.
    Garbage(String),
    /// Answer correctly, but only after the given delay.
    Delay(Duration),
}

struct Shared<D> {
    device: Mutex<D>,
    log: Mutex<Vec<String>>,
    faults: Mutex<VecDeque<Fault>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side view of a [`MockLink`]: inspect calls, inject faults, poke the device.
pub struct MockHandle<D> {
    shared: Arc<Shared<D>>,
}

impl<D> Clone for MockHandle<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D> MockHandle<D> {
    /// Methods received so far, in order.
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.shared.log).clone()
    }

    /// How many times `method` has been received.
    pub fn count(&self, method: &str) -> usize {
        lock(&self.shared.log).iter().filter(|m| *m == method).count()
    }

    /// Clear the call log.
    pub fn clear_log(&self) {
        lock(&self.shared.log).clear();
    }

    /// Queue a fault for the next request not already covered by one.
    pub fn inject(&self, fault: Fault) {
        lock(&self.shared.faults).push_back(fault);
    }

    /// Highest number of requests ever awaiting a reply at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Run `f` against the simulated device.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut lock(&self.shared.device))
    }
}

/// Link that answers from a [`DeviceHandler`] in the same process.
pub struct MockLink<D> {
    shared: Arc<Shared<D>>,
    outgoing: VecDeque<(Instant, String)>,
}

impl<D: DeviceHandler> MockLink<D> {
    /// Create a link around `device`.
    pub fn new(device: D) -> Self {
        Self {
            shared: Arc::new(Shared {
                device: Mutex::new(device),
                log: Mutex::new(Vec::new()),
                faults: Mutex::new(VecDeque::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
            outgoing: VecDeque::new(),
        }
    }

    /// A handle sharing this link's device, log and fault queue.
    pub fn handle(&self) -> MockHandle<D> {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn reply_frame(&self, method: &str, params: &Value, id: Value) -> String {
        let outcome = lock(&self.shared.device).handle(method, params);
        let envelope = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "result": result, "id": id}),
            Err(message) => json!({
                "jsonrpc": "2.0",
                "error": {"code": -32000, "message": message},
                "id": id,
            }),
        };
        envelope.to_string()
    }
}

#[async_trait]
impl<D: DeviceHandler + 'static> Link for MockLink<D> {
    async fn send(&mut self, frame: &str) -> AppResult<()> {
        let request: Value = serde_json::from_str(frame)
            .map_err(|e| FlexError::Protocol(format!("mock received unparseable frame: {e}")))?;
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let id = request.get("id").cloned().unwrap_or(Value::Null);

        lock(&self.shared.log).push(method.clone());
        let in_flight = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let now = Instant::now();
        let fault = lock(&self.shared.faults).pop_front();
        match fault {
            Some(Fault::Silence) => {
                self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Some(Fault::Garbage(text)) => self.outgoing.push_back((now, text)),
            Some(Fault::Delay(delay)) => {
                let frame = self.reply_frame(&method, &params, id);
                self.outgoing.push_back((now + delay, frame));
            }
            None => {
                let frame = self.reply_frame(&method, &params, id);
                self.outgoing.push_back((now, frame));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> AppResult<String> {
        let Some((ready_at, _)) = self.outgoing.front() else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(*ready_at).await;
        let (_, frame) = self
            .outgoing
            .pop_front()
            .ok_or_else(|| FlexError::Connection("mock reply queue drained".to_string()))?;
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn peer(&self) -> String {
        "mock".to_string()
    }
}
