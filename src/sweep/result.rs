//! Waveforms returned by a finished sweep.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppResult, FlexError};
use crate::instrument::required;

/// The four waveforms recorded for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelWaveforms {
    /// Channel number.
    #[serde(rename = "Channel")]
    pub channel: u32,
    /// Measured input.
    #[serde(rename = "Input")]
    pub input: Vec<f64>,
    /// Applied output.
    #[serde(rename = "Output")]
    pub output: Vec<f64>,
    /// In-phase demodulated signal.
    #[serde(rename = "X")]
    pub in_phase: Vec<f64>,
    /// Quadrature demodulated signal.
    #[serde(rename = "Y")]
    pub quadrature: Vec<f64>,
}

impl ChannelWaveforms {
    /// Samples per waveform.
    pub fn len(&self) -> usize {
        self.output.len()
    }

    /// Whether the waveforms hold no samples.
    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    /// Decode a `getSweepWaveforms` reply.
    ///
    /// Every channel's four waveforms must have the same length.
    pub fn from_bundle(reply: &Value) -> AppResult<Vec<Self>> {
        let channels = required(reply, "getSweepWaveforms", "Channels")?;
        let channels: Vec<Self> = serde_json::from_value(channels.clone())
            .map_err(|e| FlexError::Protocol(format!("malformed waveform bundle: {e}")))?;
        for channel in &channels {
            channel.check_lengths()?;
        }
        Ok(channels)
    }

    fn check_lengths(&self) -> AppResult<()> {
        let n = self.output.len();
        if self.input.len() == n && self.in_phase.len() == n && self.quadrature.len() == n {
            Ok(())
        } else {
            Err(FlexError::Protocol(format!(
                "channel {} waveforms have unequal lengths (input {}, output {}, X {}, Y {})",
                self.channel,
                self.input.len(),
                n,
                self.in_phase.len(),
                self.quadrature.len()
            )))
        }
    }
}

/// Outcome of a completed sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepResult {
    /// Waveforms per channel, in the order the device reported them.
    pub channels: Vec<ChannelWaveforms>,
    /// Time from the first state poll to the terminal state.
    pub elapsed: Duration,
    /// Number of state polls issued.
    pub polls: u32,
}

impl SweepResult {
    /// Waveforms of `channel`, if present.
    pub fn channel(&self, channel: u32) -> Option<&ChannelWaveforms> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    /// Keep only `channel`, failing with [`FlexError::KeyMissing`] if absent.
    pub fn restrict_to(mut self, channel: u32) -> AppResult<Self> {
        self.channels.retain(|c| c.channel == channel);
        if self.channels.is_empty() {
            return Err(FlexError::KeyMissing {
                method: "getSweepWaveforms".into(),
                key: format!("Channel {channel}"),
            });
        }
        Ok(self)
    }
}
