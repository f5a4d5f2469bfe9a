//! Sweep programs: what each output channel does during a sweep.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AppResult, FlexError};

/// Shape of a channel's output trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPattern {
    /// Linear ramp from start to stop.
    Ramp,
    /// Cosine-eased ramp from start to stop.
    SmoothRamp,
    /// Explicit setpoint table.
    Table,
}

impl SweepPattern {
    /// Name the lock-in server uses for this pattern.
    pub fn as_wire(self) -> &'static str {
        match self {
            SweepPattern::Ramp => "Ramp /",
            SweepPattern::SmoothRamp => "Smooth Ramp /",
            SweepPattern::Table => "Table",
        }
    }

    /// Inverse of [`as_wire`](Self::as_wire).
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "Ramp /" => Some(SweepPattern::Ramp),
            "Smooth Ramp /" => Some(SweepPattern::SmoothRamp),
            "Table" => Some(SweepPattern::Table),
            _ => None,
        }
    }
}

impl fmt::Display for SweepPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SweepPattern::Ramp => "ramp",
            SweepPattern::SmoothRamp => "smooth-ramp",
            SweepPattern::Table => "table",
        })
    }
}

impl FromStr for SweepPattern {
    type Err = FlexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ramp" => Ok(SweepPattern::Ramp),
            "smooth-ramp" | "smoothramp" => Ok(SweepPattern::SmoothRamp),
            "table" => Ok(SweepPattern::Table),
            other => Err(FlexError::InvalidSweep(format!(
                "unknown pattern '{other}' (expected ramp, smooth-ramp or table)"
            ))),
        }
    }
}

/// One output channel's part of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepChannel {
    /// AO channel number (1-based).
    pub channel: u32,
    /// Output at the start of the sweep, in volts.
    pub start: f64,
    /// Output at the end of the sweep, in volts.
    pub stop: f64,
    /// Trajectory between start and stop.
    pub pattern: SweepPattern,
    /// Setpoints for [`SweepPattern::Table`]; ignored for other patterns.
    pub table: Vec<f64>,
}

impl SweepChannel {
    /// Linear ramp from `start` to `stop`.
    pub fn ramp(channel: u32, start: f64, stop: f64) -> Self {
        Self {
            channel,
            start,
            stop,
            pattern: SweepPattern::Ramp,
            table: Vec::new(),
        }
    }

    /// Step through `table`.
    pub fn table(channel: u32, table: Vec<f64>) -> Self {
        let start = table.first().copied().unwrap_or_default();
        let stop = table.last().copied().unwrap_or_default();
        Self {
            channel,
            start,
            stop,
            pattern: SweepPattern::Table,
            table,
        }
    }

    /// Replace the pattern.
    pub fn with_pattern(mut self, pattern: SweepPattern) -> Self {
        self.pattern = pattern;
        self
    }

    fn validate(&self) -> AppResult<()> {
        let channel = self.channel;
        if channel == 0 {
            return Err(FlexError::InvalidSweep("channel numbers start at 1".into()));
        }
        if !self.start.is_finite() || !self.stop.is_finite() {
            return Err(FlexError::InvalidSweep(format!(
                "channel {channel}: start and stop must be finite"
            )));
        }
        if self.pattern == SweepPattern::Table {
            if self.table.is_empty() {
                return Err(FlexError::InvalidSweep(format!(
                    "channel {channel}: table pattern needs at least one setpoint"
                )));
            }
            if self.table.iter().any(|v| !v.is_finite()) {
                return Err(FlexError::InvalidSweep(format!(
                    "channel {channel}: table setpoints must be finite"
                )));
            }
        }
        Ok(())
    }

    fn to_wire(&self) -> Value {
        let table: &[f64] = match self.pattern {
            SweepPattern::Table => &self.table,
            SweepPattern::Ramp | SweepPattern::SmoothRamp => &[],
        };
        json!({
            "Enable?": true,
            "Channel": self.channel,
            "Start": self.start,
            "End": self.stop,
            "Pattern": self.pattern.as_wire(),
            "Table": table,
        })
    }
}

/// A complete sweep program.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    /// Channels that sweep together.
    pub channels: Vec<SweepChannel>,
    /// Time from first to last setpoint.
    pub duration: Duration,
    /// Hold at the start values before ramping.
    pub initial_wait: Duration,
    /// Return outputs to their start values afterwards.
    pub return_to_start: bool,
}

impl SweepConfig {
    /// An empty program lasting `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            channels: Vec::new(),
            duration,
            initial_wait: Duration::ZERO,
            return_to_start: false,
        }
    }

    /// One channel ramping linearly from `start` to `stop` over `duration`.
    pub fn single(channel: u32, start: f64, stop: f64, duration: Duration) -> Self {
        Self::new(duration).channel(SweepChannel::ramp(channel, start, stop))
    }

    /// Add a channel.
    pub fn channel(mut self, channel: SweepChannel) -> Self {
        self.channels.push(channel);
        self
    }

    /// Set the initial wait.
    pub fn initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    /// Set the return-to-start flag.
    pub fn return_to_start(mut self, enabled: bool) -> Self {
        self.return_to_start = enabled;
        self
    }

    /// Check the program before anything is sent.
    pub fn validate(&self) -> AppResult<()> {
        if self.duration.is_zero() {
            return Err(FlexError::InvalidSweep("duration must be positive".into()));
        }
        if self.channels.is_empty() {
            return Err(FlexError::InvalidSweep("no channels to sweep".into()));
        }
        for (i, channel) in self.channels.iter().enumerate() {
            channel.validate()?;
            if self.channels[..i].iter().any(|c| c.channel == channel.channel) {
                return Err(FlexError::InvalidSweep(format!(
                    "channel {} listed twice",
                    channel.channel
                )));
            }
        }
        Ok(())
    }

    /// `setSweep` parameters for this program.
    pub fn to_wire(&self) -> Value {
        let channels: Vec<Value> = self.channels.iter().map(SweepChannel::to_wire).collect();
        json!({
            "Sweep Time (s)": self.duration.as_secs_f64(),
            "Initial Wait (s)": self.initial_wait.as_secs_f64(),
            "Return to Start": self.return_to_start,
            "Channels": channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_table_patterns_send_empty_table() {
        let mut channel = SweepChannel::ramp(2, 0.0, 0.1);
        channel.table = vec![1.0, 2.0];
        let config = SweepConfig::new(Duration::from_secs(20)).channel(channel);
        let wire = config.to_wire();
        assert_eq!(wire["Channels"][0]["Table"], json!([]));
        assert_eq!(wire["Channels"][0]["Pattern"], json!("Ramp /"));
        assert_eq!(wire["Sweep Time (s)"], json!(20.0));
    }

    #[test]
    fn table_pattern_keeps_setpoints() {
        let config =
            SweepConfig::new(Duration::from_secs(1)).channel(SweepChannel::table(1, vec![0.0, 0.5]));
        config.validate().unwrap();
        assert_eq!(config.to_wire()["Channels"][0]["Table"], json!([0.0, 0.5]));
    }

    #[test]
    fn empty_table_is_rejected() {
        let config =
            SweepConfig::new(Duration::from_secs(1)).channel(SweepChannel::table(1, Vec::new()));
        assert!(matches!(config.validate(), Err(FlexError::InvalidSweep(_))));
    }

    #[test]
    fn degenerate_programs_are_rejected() {
        let cases = [
            SweepConfig::new(Duration::from_secs(1)),
            SweepConfig::single(1, 0.0, 1.0, Duration::ZERO),
            SweepConfig::single(0, 0.0, 1.0, Duration::from_secs(1)),
            SweepConfig::single(1, f64::NAN, 1.0, Duration::from_secs(1)),
            SweepConfig::single(1, 0.0, 1.0, Duration::from_secs(1))
                .channel(SweepChannel::ramp(1, 1.0, 0.0)),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(FlexError::InvalidSweep(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn pattern_names() {
        for pattern in [SweepPattern::Ramp, SweepPattern::SmoothRamp, SweepPattern::Table] {
            assert_eq!(SweepPattern::from_wire(pattern.as_wire()), Some(pattern));
            assert_eq!(pattern.to_string().parse::<SweepPattern>().unwrap(), pattern);
        }
        assert!("sawtooth".parse::<SweepPattern>().is_err());
    }
}
