//! Typed instrument clients.
//!
//! [`InstrumentClient`] is the device-independent layer on top of
//! [`TransportClient`]: it performs the common handshake and help queries and
//! turns keyed reply maps into typed values. The device drivers wrap it with
//! typed getters and setters that validate before sending:
//!
//! - [`amplifier::Kh7008`] - Krohn-Hite 7008 eight-channel amplifier
//! - [`lockin::MultichannelLockin`] - multichannel lock-in / AO / sweep engine
//! - [`cryostat::Ppms`] - Quantum Design PPMS temperature and field control
//!
//! Each driver lists the remote methods it uses in a static [`CommandSet`];
//! [`InstrumentClient::missing_commands`] checks that table against what the
//! server actually advertises.
//!
//! Drivers borrow the transport and hold no device state of their own, so a
//! value read through one is never reused by a later call.

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::{AppResult, FlexError};
use crate::transport::{no_params, TransportClient};

pub mod amplifier;
pub mod cryostat;
pub mod lockin;

pub use amplifier::{ChannelConfig, ChannelUpdate, Kh7008};
pub use cryostat::{Ppms, WaitSettings};
pub use lockin::{AoChannel, LockinQuantity, MultichannelLockin, StateRequest};

/// Number of framework commands every server lists before its own.
pub const FRAMEWORK_COMMAND_COUNT: usize = 5;

/// Absolute tolerance used when comparing a read-back float to its setpoint.
pub const READBACK_TOLERANCE: f64 = 1e-9;

/// The statically known command table of a device family.
pub trait CommandSet {
    /// Short device name used in logs.
    const NAME: &'static str;
    /// Address the vendor server listens on by default.
    const DEFAULT_ADDRESS: &'static str;
    /// Remote methods this driver calls.
    const COMMANDS: &'static [&'static str];
}

/// Device-independent request helpers bound to one transport.
#[derive(Clone, Copy)]
pub struct InstrumentClient<'t> {
    transport: &'t TransportClient,
    name: &'static str,
}

impl<'t> InstrumentClient<'t> {
    /// Wrap `transport`; `name` labels log output.
    pub fn new(transport: &'t TransportClient, name: &'static str) -> Self {
        Self { transport, name }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &'t TransportClient {
        self.transport
    }

    /// Device name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Issue one command and return its result unchanged.
    pub async fn request(&self, method: &str, params: Value) -> AppResult<Value> {
        debug!(device = self.name, method, "Instrument request");
        self.transport.call(method, params).await
    }

    /// Handshake: the server must answer `ACK` with `"ACK"`.
    #[instrument(skip(self), fields(device = self.name), err)]
    pub async fn ack(&self) -> AppResult<()> {
        let reply = self.request("ACK", no_params()).await?;
        match reply.as_str() {
            Some("ACK") => Ok(()),
            _ => Err(FlexError::Protocol(format!(
                "{} answered ACK with {reply}",
                self.name
            ))),
        }
    }

    /// Help text from the server.
    ///
    /// With no command, returns the device's own command listing (framework
    /// commands are skipped). With a command, returns its description lines.
    pub async fn help(&self, command: Option<&str>) -> AppResult<Vec<String>> {
        let params = match command {
            Some(command) => json!({ "command": command }),
            None => no_params(),
        };
        let reply = self.request("HELP", params).await?;
        let lines = string_list(&reply, "HELP")?;
        Ok(match command {
            Some(_) => lines,
            None => lines.into_iter().skip(FRAMEWORK_COMMAND_COUNT).collect(),
        })
    }

    /// Commands of `C` the server does not advertise.
    pub async fn missing_commands<C: CommandSet>(&self) -> AppResult<Vec<&'static str>> {
        let advertised = self.help(None).await?;
        let missing: Vec<&'static str> = C::COMMANDS
            .iter()
            .copied()
            .filter(|command| !advertised.iter().any(|a| a == command))
            .collect();
        if !missing.is_empty() {
            debug!(device = C::NAME, ?missing, "Server lacks expected commands");
        }
        Ok(missing)
    }
}

fn string_list(reply: &Value, method: &str) -> AppResult<Vec<String>> {
    match reply {
        Value::String(line) => Ok(vec![line.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    FlexError::Protocol(format!("{method} listing contains non-string {item}"))
                })
            })
            .collect(),
        other => Err(FlexError::Protocol(format!(
            "{method} returned {other} instead of a listing"
        ))),
    }
}

/// Look up `key` in a keyed reply.
///
/// An absent key is [`FlexError::KeyMissing`]; a present `null` is returned
/// as-is so callers can tell "no reading" apart from "no such field".
pub fn required<'v>(reply: &'v Value, method: &str, key: &str) -> AppResult<&'v Value> {
    reply.get(key).ok_or_else(|| FlexError::KeyMissing {
        method: method.to_string(),
        key: key.to_string(),
    })
}

/// A numeric field that may legitimately be null.
pub fn optional_f64(reply: &Value, method: &str, key: &str) -> AppResult<Option<f64>> {
    match required(reply, method, key)? {
        Value::Null => Ok(None),
        value => value.as_f64().map(Some).ok_or_else(|| {
            FlexError::Protocol(format!("'{key}' in reply to '{method}' is not a number: {value}"))
        }),
    }
}

/// A numeric field that must be present and non-null.
pub fn required_f64(reply: &Value, method: &str, key: &str) -> AppResult<f64> {
    optional_f64(reply, method, key)?.ok_or_else(|| {
        FlexError::Protocol(format!("'{key}' in reply to '{method}' is null"))
    })
}

/// A string field that must be present and non-null.
pub fn required_str<'v>(reply: &'v Value, method: &str, key: &str) -> AppResult<&'v str> {
    let value = required(reply, method, key)?;
    value.as_str().ok_or_else(|| {
        FlexError::Protocol(format!("'{key}' in reply to '{method}' is not a string: {value}"))
    })
}

/// Reject NaN and infinities before they reach the wire as `null`.
pub fn require_finite(parameter: &str, value: f64) -> AppResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(FlexError::NotFinite {
            parameter: parameter.to_string(),
            value,
        })
    }
}

/// Fail with [`FlexError::ValueConsistency`] unless `actual` matches `requested`.
pub fn check_readback(parameter: &str, requested: f64, actual: f64) -> AppResult<()> {
    if (requested - actual).abs() <= READBACK_TOLERANCE {
        Ok(())
    } else {
        Err(FlexError::ValueConsistency {
            parameter: parameter.to_string(),
            requested: requested.to_string(),
            actual: actual.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedCryostat, FRAMEWORK_METHODS};
    use crate::transport::MockLink;
    use std::time::Duration;

    struct Ppmsish;

    impl CommandSet for Ppmsish {
        const NAME: &'static str = "PPMS";
        const DEFAULT_ADDRESS: &'static str = "tcp://localhost:29270";
        const COMMANDS: &'static [&'static str] = &["Get Temperature", "Set Helium Level"];
    }

    fn transport() -> TransportClient {
        let link = MockLink::new(SimulatedCryostat::new());
        TransportClient::with_link("mock://ppms", Box::new(link), Duration::from_secs(1))
    }

    #[test]
    fn framework_count_matches_simulators() {
        assert_eq!(FRAMEWORK_METHODS.len(), FRAMEWORK_COMMAND_COUNT);
    }

    #[tokio::test]
    async fn ack_and_help() {
        let transport = transport();
        let client = InstrumentClient::new(&transport, "PPMS");
        client.ack().await.unwrap();

        let listing = client.help(None).await.unwrap();
        assert_eq!(listing.first().map(String::as_str), Some("Set Temperature"));
        assert!(!listing.iter().any(|c| c == "ACK"));

        let detail = client.help(Some("Get Magnet")).await.unwrap();
        assert_eq!(detail.len(), 1);
    }

    #[tokio::test]
    async fn missing_commands_reports_unadvertised_methods() {
        let transport = transport();
        let client = InstrumentClient::new(&transport, "PPMS");
        let missing = client.missing_commands::<Ppmsish>().await.unwrap();
        assert_eq!(missing, vec!["Set Helium Level"]);
    }

    #[test]
    fn missing_key_differs_from_null() {
        let reply = json!({"Temperature (K)": null});
        assert_eq!(optional_f64(&reply, "Get Temperature", "Temperature (K)").unwrap(), None);
        assert!(matches!(
            optional_f64(&reply, "Get Temperature", "Field (T)"),
            Err(FlexError::KeyMissing { .. })
        ));
        assert!(matches!(
            required_f64(&reply, "Get Temperature", "Temperature (K)"),
            Err(FlexError::Protocol(_))
        ));
    }

    #[test]
    fn readback_mismatch_is_consistency_error() {
        assert!(check_readback("amplitude", 0.25, 0.25).is_ok());
        match check_readback("amplitude", 2.0, 0.5) {
            Err(FlexError::ValueConsistency { requested, actual, .. }) => {
                assert_eq!(requested, "2");
                assert_eq!(actual, "0.5");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
