//! Krohn-Hite 7008 eight-channel amplifier driver.
//!
//! ## Channel records
//!
//! Every channel is configured as one record:
//!
//! ```json
//! {"channel": 1, "gain": 10, "input": "SE+", "shunt": 500, "couple": "AC", "filter": "ON"}
//! ```
//!
//! All six fields are restricted to the allowed-value tables in
//! [`crate::validator`]. Records are validated as a whole before anything is
//! sent. The server may report shunt and gain with magnitude suffixes
//! (`"10M"`); these are decoded on read.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::{required, required_str, CommandSet, InstrumentClient};
use crate::error::{AppResult, FlexError};
use crate::transport::{no_params, TransportClient};
use crate::validator::{self, ParamValue, Parameter};

/// Parameters that make up a channel record, in record order.
pub const CHANNEL_PARAMETERS: [Parameter; 6] = [
    Parameter::Channel,
    Parameter::Gain,
    Parameter::Input,
    Parameter::Shunt,
    Parameter::Couple,
    Parameter::Filter,
];

/// Complete configuration of one amplifier channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelConfig {
    /// Channel number, 1-8.
    pub channel: i64,
    /// Gain: 1, 10, 100 or 1000.
    pub gain: i64,
    /// Input mode: OFF, SE+, SE- or DIFF.
    pub input: String,
    /// Shunt resistance in ohms.
    pub shunt: i64,
    /// Coupling: AC or DC.
    pub couple: String,
    /// Low-pass filter: OFF or ON.
    pub filter: String,
}

impl ChannelConfig {
    /// Check every field against its allowed-value table.
    ///
    /// Fields are checked in record order; the first rejection is reported.
    pub fn validate(&self) -> Result<(), validator::ValidationError> {
        validator::validate(Parameter::Channel, self.channel)?;
        validator::validate(Parameter::Gain, self.gain)?;
        validator::validate(Parameter::Input, self.input.as_str())?;
        validator::validate(Parameter::Shunt, self.shunt)?;
        validator::validate(Parameter::Couple, self.couple.as_str())?;
        validator::validate(Parameter::Filter, self.filter.as_str())?;
        Ok(())
    }

    /// Decode a record as reported by the server.
    ///
    /// Integer fields may carry magnitude suffixes. Missing fields are
    /// [`crate::FlexError::KeyMissing`]; decoded values must be in their tables.
    pub fn from_reply(reply: &Value, method: &str) -> AppResult<Self> {
        let int = |key: &str| -> AppResult<i64> {
            Ok(validator::parse_integer_value(required(reply, method, key)?)?)
        };
        let text = |key: &str| -> AppResult<String> {
            Ok(required_str(reply, method, key)?.to_string())
        };
        let config = Self {
            channel: int("channel")?,
            gain: int("gain")?,
            input: text("input")?,
            shunt: int("shunt")?,
            couple: text("couple")?,
            filter: text("filter")?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// A partial channel update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelUpdate {
    /// New gain.
    pub gain: Option<i64>,
    /// New input mode.
    pub input: Option<String>,
    /// New shunt resistance.
    pub shunt: Option<i64>,
    /// New coupling.
    pub couple: Option<String>,
    /// New filter state.
    pub filter: Option<String>,
}

impl ChannelUpdate {
    /// An update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gain.
    pub fn gain(mut self, gain: i64) -> Self {
        self.gain = Some(gain);
        self
    }

    /// Set the input mode.
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Set the shunt resistance.
    pub fn shunt(mut self, shunt: i64) -> Self {
        self.shunt = Some(shunt);
        self
    }

    /// Set the coupling.
    pub fn couple(mut self, couple: impl Into<String>) -> Self {
        self.couple = Some(couple.into());
        self
    }

    /// Set the filter state.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overlay the supplied fields onto `current`.
    pub fn apply_to(&self, current: &ChannelConfig) -> ChannelConfig {
        ChannelConfig {
            channel: current.channel,
            gain: self.gain.unwrap_or(current.gain),
            input: self.input.clone().unwrap_or_else(|| current.input.clone()),
            shunt: self.shunt.unwrap_or(current.shunt),
            couple: self.couple.clone().unwrap_or_else(|| current.couple.clone()),
            filter: self.filter.clone().unwrap_or_else(|| current.filter.clone()),
        }
    }
}

/// Krohn-Hite 7008 driver.
pub struct Kh7008<'t> {
    client: InstrumentClient<'t>,
}

impl CommandSet for Kh7008<'_> {
    const NAME: &'static str = "KH7008";
    const DEFAULT_ADDRESS: &'static str = "tcp://localhost:29160";
    const COMMANDS: &'static [&'static str] =
        &["setAllChannels", "getAllChannels", "setChannel", "getChannel"];
}

impl<'t> Kh7008<'t> {
    /// Bind to `transport`.
    pub fn new(transport: &'t TransportClient) -> Self {
        Self {
            client: InstrumentClient::new(transport, Self::NAME),
        }
    }

    /// The device-independent client.
    pub fn client(&self) -> &InstrumentClient<'t> {
        &self.client
    }

    /// Allowed values for every channel parameter.
    pub fn allowed_values() -> Vec<(Parameter, &'static [ParamValue<'static>])> {
        CHANNEL_PARAMETERS
            .iter()
            .map(|p| (*p, validator::allowed_values(*p)))
            .collect()
    }

    /// Configure several channels in one command.
    ///
    /// Every record is validated first; if any is rejected nothing is sent.
    #[instrument(skip(self, configs), fields(count = configs.len()), err)]
    pub async fn set_all_channels(&self, configs: &[ChannelConfig]) -> AppResult<()> {
        for config in configs {
            config.validate()?;
        }
        self.client
            .request("setAllChannels", json!({ "params": configs }))
            .await?;
        info!(count = configs.len(), "KH7008 channels configured");
        Ok(())
    }

    /// Current configuration of every channel.
    pub async fn all_channels(&self) -> AppResult<Vec<ChannelConfig>> {
        let reply = self.client.request("getAllChannels", no_params()).await?;
        let records = reply.as_array().ok_or_else(|| {
            FlexError::Protocol(format!("getAllChannels returned {reply}"))
        })?;
        records
            .iter()
            .map(|record| ChannelConfig::from_reply(record, "getAllChannels"))
            .collect()
    }

    /// Current configuration of `channel`.
    ///
    /// A reply describing any other channel is a [`FlexError::Protocol`].
    pub async fn channel(&self, channel: i64) -> AppResult<ChannelConfig> {
        validator::validate(Parameter::Channel, channel)?;
        let reply = self
            .client
            .request("getChannel", json!({ "channel": channel }))
            .await?;
        let config = ChannelConfig::from_reply(&reply, "getChannel")?;
        if config.channel != channel {
            return Err(FlexError::Protocol(format!(
                "getChannel({channel}) returned channel {}",
                config.channel
            )));
        }
        Ok(config)
    }

    /// Replace one channel's configuration.
    #[instrument(skip(self), fields(channel = config.channel), err)]
    pub async fn set_channel(&self, config: &ChannelConfig) -> AppResult<()> {
        config.validate()?;
        self.client
            .request("setChannel", json!({ "params": config }))
            .await?;
        Ok(())
    }

    /// Change selected fields of one channel.
    ///
    /// Reads the current record, overlays `update`, validates the merged record
    /// and sends it as a single `setChannel`. There is no lock across the read
    /// and the write: two concurrent updates of one channel race and the last
    /// write wins.
    #[instrument(skip(self), err)]
    pub async fn update_channel(
        &self,
        channel: i64,
        update: &ChannelUpdate,
    ) -> AppResult<ChannelConfig> {
        let current = self.channel(channel).await?;
        let merged = update.apply_to(&current);
        merged.validate()?;
        if merged == current {
            debug!(channel, "Channel already in requested state");
        }
        self.client
            .request("setChannel", json!({ "params": merged }))
            .await?;
        Ok(merged)
    }
}
