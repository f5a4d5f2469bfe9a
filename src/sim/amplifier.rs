//! Simulated Krohn-Hite 7008 eight-channel amplifier.

use serde_json::{json, Value};

use super::{field, framework_reply, DeviceHandler};
use crate::validator::{self, ParamValue, Parameter};

const METHODS: &[&str] = &["setAllChannels", "getAllChannels", "setChannel", "getChannel"];

const CHANNEL_COUNT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChannelState {
    gain: i64,
    input: String,
    shunt: i64,
    couple: String,
    filter: String,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            gain: 1,
            input: "OFF".to_string(),
            shunt: 0,
            couple: "DC".to_string(),
            filter: "OFF".to_string(),
        }
    }
}

/// In-memory KH7008.
///
/// Like the real front end, shunt values are reported with magnitude
/// suffixes (`"10M"`, `"5k"`) unless [`with_plain_numbers`](Self::with_plain_numbers)
/// is used.
#[derive(Debug, Clone)]
pub struct SimulatedAmplifier {
    channels: [ChannelState; CHANNEL_COUNT],
    suffixed: bool,
}

impl Default for SimulatedAmplifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAmplifier {
    /// All channels off, gain 1, DC coupled.
    pub fn new() -> Self {
        Self {
            channels: std::array::from_fn(|_| ChannelState::default()),
            suffixed: true,
        }
    }

    /// Report shunt resistance as a plain JSON number.
    pub fn with_plain_numbers(mut self) -> Self {
        self.suffixed = false;
        self
    }

    /// Current input mode of `channel` (1-based), for test assertions.
    pub fn input(&self, channel: usize) -> Option<&str> {
        self.channels
            .get(channel.checked_sub(1)?)
            .map(|c| c.input.as_str())
    }

    fn index(channel: &Value) -> Result<usize, String> {
        let number = channel
            .as_i64()
            .ok_or_else(|| format!("Channel must be an integer, got {channel}"))?;
        match usize::try_from(number) {
            Ok(n @ 1..=CHANNEL_COUNT) => Ok(n - 1),
            _ => Err(format!("Channel {number} out of range 1-{CHANNEL_COUNT}")),
        }
    }

    fn render(&self, index: usize) -> Value {
        let state = &self.channels[index];
        let shunt = if self.suffixed {
            json!(suffixed(state.shunt))
        } else {
            json!(state.shunt)
        };
        json!({
            "channel": index + 1,
            "gain": state.gain,
            "input": state.input,
            "shunt": shunt,
            "couple": state.couple,
            "filter": state.filter,
        })
    }

    fn apply(&mut self, record: &Value) -> Result<(), String> {
        let record = record
            .as_object()
            .ok_or_else(|| "Channel record must be an object".to_string())?;
        let index = Self::index(record.get("channel").unwrap_or(&Value::Null))?;
        let mut next = self.channels[index].clone();

        for (key, value) in record {
            match key.as_str() {
                "channel" => {}
                "gain" => next.gain = checked_int(Parameter::Gain, value)?,
                "shunt" => next.shunt = checked_int(Parameter::Shunt, value)?,
                "input" => next.input = checked_text(Parameter::Input, value)?,
                "couple" => next.couple = checked_text(Parameter::Couple, value)?,
                "filter" => next.filter = checked_text(Parameter::Filter, value)?,
                other => return Err(format!("Unknown channel setting '{other}'")),
            }
        }

        self.channels[index] = next;
        Ok(())
    }
}

fn checked_int(parameter: Parameter, value: &Value) -> Result<i64, String> {
    let number = validator::parse_integer_value(value).map_err(|e| e.to_string())?;
    validator::validate(parameter, number).map_err(|e| e.to_string())?;
    Ok(number)
}

fn checked_text(parameter: Parameter, value: &Value) -> Result<String, String> {
    let text = value
        .as_str()
        .ok_or_else(|| format!("{parameter} must be a string"))?;
    validator::validate(parameter, ParamValue::Text(text)).map_err(|e| e.to_string())?;
    Ok(text.to_string())
}

fn suffixed(value: i64) -> String {
    if value != 0 && value % 1_000_000 == 0 {
        format!("{}M", value / 1_000_000)
    } else if value != 0 && value % 1_000 == 0 {
        format!("{}k", value / 1_000)
    } else {
        value.to_string()
    }
}

impl DeviceHandler for SimulatedAmplifier {
    fn handle(&mut self, method: &str, params: &Value) -> Result<Value, String> {
        if let Some(reply) = framework_reply(method, params, METHODS) {
            return reply;
        }
        match method {
            "getChannel" => {
                let index = Self::index(field(params, "channel")?)?;
                Ok(self.render(index))
            }
            "getAllChannels" => Ok(Value::Array(
                (0..CHANNEL_COUNT).map(|i| self.render(i)).collect(),
            )),
            "setChannel" => {
                self.apply(field(params, "params")?)?;
                Ok(Value::Null)
            }
            "setAllChannels" => {
                let records = field(params, "params")?
                    .as_array()
                    .ok_or_else(|| "setAllChannels expects a list of records".to_string())?;
                // All-or-nothing, like the front panel's batch apply.
                let mut staged = self.clone();
                for record in records {
                    staged.apply(record)?;
                }
                self.channels = staged.channels;
                Ok(Value::Null)
            }
            other => Err(format!("Method '{other}' not found")),
        }
    }
}
