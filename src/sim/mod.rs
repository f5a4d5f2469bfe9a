//! Simulated instrument servers.
//!
//! Provides simulated devices for testing without physical hardware. Each
//! simulator answers the same methods as the real instrument server and can
//! be driven in-process through [`crate::transport::MockLink`] or exposed on a
//! TCP port with [`spawn_server`].
//!
//! # Available Simulators
//!
//! - [`SimulatedAmplifier`] - eight-channel Krohn-Hite 7008 amplifier
//! - [`SimulatedLockin`] - multichannel lock-in with timed sweeps
//! - [`SimulatedCryostat`] - PPMS temperature and field controller
//!
//! All timing uses `tokio::time::Instant`, so tests running with a paused
//! clock see sweeps and ramps complete instantly.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppResult, FlexError};
use crate::transport::{Link, TcpLink};

pub mod amplifier;
pub mod cryostat;
pub mod lockin;

pub use amplifier::SimulatedAmplifier;
pub use cryostat::SimulatedCryostat;
pub use lockin::SimulatedLockin;

/// Methods every instrument server answers before its own command set.
pub const FRAMEWORK_METHODS: [&str; 5] = ["ACK", "HELP", "Get Methods", "Get Instrument Info", "Exit"];

/// Server-side behaviour of a simulated instrument.
pub trait DeviceHandler: Send {
    /// Answer one request: `Ok(result)` or `Err(error message)`.
    fn handle(&mut self, method: &str, params: &Value) -> Result<Value, String>;
}

/// Answer the framework methods shared by all simulators.
///
/// Returns `None` when `method` is device-specific.
pub(crate) fn framework_reply(
    method: &str,
    params: &Value,
    device_methods: &[&str],
) -> Option<Result<Value, String>> {
    match method {
        "ACK" => Some(Ok(json!("ACK"))),
        "HELP" => {
            if let Some(command) = params.get("command").and_then(Value::as_str) {
                return Some(if device_methods.contains(&command) {
                    Ok(json!([format!("{command}: see instrument manual")]))
                } else {
                    Err(format!("Unknown command '{command}'"))
                });
            }
            let listing: Vec<&str> = FRAMEWORK_METHODS
                .iter()
                .chain(device_methods)
                .copied()
                .collect();
            Some(Ok(json!(listing)))
        }
        _ => None,
    }
}

pub(crate) fn field<'a>(params: &'a Value, key: &str) -> Result<&'a Value, String> {
    params
        .get(key)
        .ok_or_else(|| format!("Missing parameter '{key}'"))
}

pub(crate) fn number(params: &Value, key: &str) -> Result<f64, String> {
    field(params, key)?
        .as_f64()
        .ok_or_else(|| format!("Parameter '{key}' must be a number"))
}

/// Serve `device` on `listener` until the listener fails.
///
/// Each connection gets its own task; requests on one connection are answered
/// strictly in order.
pub async fn serve<D: DeviceHandler + 'static>(
    listener: TcpListener,
    device: Arc<Mutex<D>>,
) -> AppResult<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "Simulator accepted connection");
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            let mut link = TcpLink::from_stream(stream, peer.to_string());
            if let Err(e) = serve_connection(&mut link, &device).await {
                debug!(%peer, error = %e, "Simulator connection ended");
            }
        });
    }
}

async fn serve_connection<D: DeviceHandler>(
    link: &mut TcpLink,
    device: &Mutex<D>,
) -> AppResult<()> {
    loop {
        let frame = link.recv().await?;
        let request: Value = match serde_json::from_str(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Simulator received unparseable request");
                let reply = json!({"jsonrpc": "2.0", "error": {"code": -32700, "message": "Parse error"}, "id": null});
                link.send(&reply.to_string()).await?;
                continue;
            }
        };
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let id = request.get("id").cloned().unwrap_or(Value::Null);

        let outcome = device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle(method, &params);
        let reply = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "result": result, "id": id}),
            Err(message) => json!({"jsonrpc": "2.0", "error": {"code": -32000, "message": message}, "id": id}),
        };
        link.send(&reply.to_string()).await?;
    }
}

/// Bind `addr` and serve `device` in a background task.
///
/// Returns the bound address (useful with port 0) and the server task.
pub async fn spawn_server<D: DeviceHandler + 'static>(
    addr: &str,
    device: D,
) -> AppResult<(SocketAddr, JoinHandle<AppResult<()>>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| FlexError::Connection(format!("cannot bind simulator to {addr}: {e}")))?;
    let local = listener.local_addr()?;
    info!(address = %local, "Simulator listening");
    let task = tokio::spawn(serve(listener, Arc::new(Mutex::new(device))));
    Ok((local, task))
}
