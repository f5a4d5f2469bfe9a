//! Simulated multichannel lock-in amplifier.
//!
//! Models the parts of the lock-in the sweep coordinator depends on:
//!
//! - a device state that lags the trigger acknowledgment by a configurable
//!   delay, then reports `sweeping` for the initial wait plus the sweep time
//! - a waveform bundle whose length is `sweep time × sample rate`
//! - analog outputs that may be silently clamped by a front-panel limit
//! - a results dictionary keyed `AI{ch}.Mean` / `AI{ch}.Ref{r}.{X|Y|R|Theta}`

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::{field, framework_reply, number, DeviceHandler};
use crate::sweep::{DeviceState, SweepPattern};
use crate::validator::{self, Parameter};

const METHODS: &[&str] = &[
    "getAO",
    "setAO_Amplitude",
    "setAO_DC",
    "setAO_Frequency",
    "setAO_Phase",
    "setAO_Function",
    "getResults",
    "setState",
    "getState",
    "setSweepTime",
    "setSamplingFsMode",
    "setSweep",
    "getSweepWaveforms",
];

/// Number of analog outputs (sweepable channels).
pub const AO_CHANNELS: usize = 4;
/// Number of analog inputs reported in the results dictionary.
pub const AI_CHANNELS: usize = 4;
/// Number of demodulation references per input.
pub const REFERENCES: usize = 2;

/// Samples per second recorded during a sweep unless overridden.
pub const DEFAULT_SAMPLE_RATE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
struct AoChannel {
    amplitude: f64,
    dc: f64,
    frequency: f64,
    phase: f64,
    function: String,
}

impl Default for AoChannel {
    fn default() -> Self {
        Self {
            amplitude: 0.0,
            dc: 0.0,
            frequency: 1000.0,
            phase: 0.0,
            function: "Sine".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ProgrammedChannel {
    channel: usize,
    start: f64,
    end: f64,
    pattern: SweepPattern,
    table: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct ProgrammedSweep {
    duration: f64,
    initial_wait: f64,
    return_to_start: bool,
    channels: Vec<ProgrammedChannel>,
}

#[derive(Debug, Clone)]
struct ActiveSweep {
    triggered_at: Instant,
    prior_state: DeviceState,
    sweep: ProgrammedSweep,
}

/// In-memory lock-in with a clock-driven sweep engine.
#[derive(Debug)]
pub struct SimulatedLockin {
    state: DeviceState,
    forced_state: Option<DeviceState>,
    trigger_lag: Duration,
    sample_rate: f64,
    sampling_mode: String,
    output_limit: Option<f64>,
    ao: [AoChannel; AO_CHANNELS],
    overloaded: [bool; AI_CHANNELS],
    programmed: Option<ProgrammedSweep>,
    active: Option<ActiveSweep>,
    waveforms: Option<Value>,
    rng: StdRng,
}

impl Default for SimulatedLockin {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLockin {
    /// Idle lock-in with no output limit and no trigger lag.
    pub fn new() -> Self {
        Self {
            state: DeviceState::Idle,
            forced_state: None,
            trigger_lag: Duration::ZERO,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sampling_mode: "Auto".to_string(),
            output_limit: None,
            ao: std::array::from_fn(|_| AoChannel::default()),
            overloaded: [false; AI_CHANNELS],
            programmed: None,
            active: None,
            waveforms: None,
            rng: StdRng::seed_from_u64(7008),
        }
    }

    /// Keep reporting the pre-trigger state for `lag` after `start sweep`.
    pub fn with_trigger_lag(mut self, lag: Duration) -> Self {
        self.trigger_lag = lag;
        self
    }

    /// Record `rate` samples per second during sweeps.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Silently clamp AO amplitude and |DC| to `limit` volts.
    pub fn with_output_limit(mut self, limit: f64) -> Self {
        self.output_limit = Some(limit);
        self
    }

    /// Report `state` regardless of what the sweep engine is doing.
    ///
    /// `None` returns control to the engine.
    pub fn force_state(&mut self, state: Option<DeviceState>) {
        self.forced_state = state;
    }

    /// Make input `channel` (1-based) report null results, as an overloaded
    /// input does.
    pub fn set_input_overload(&mut self, channel: usize, overloaded: bool) {
        if let Some(slot) = channel.checked_sub(1).and_then(|i| self.overloaded.get_mut(i)) {
            *slot = overloaded;
        }
    }

    /// Number of samples per waveform a sweep of `duration_s` produces.
    pub fn sample_count(&self, duration_s: f64) -> usize {
        (duration_s * self.sample_rate).round().max(0.0) as usize
    }

    /// Current DC offset of AO `channel` (1-based).
    pub fn ao_dc(&self, channel: usize) -> Option<f64> {
        self.ao.get(channel.checked_sub(1)?).map(|c| c.dc)
    }

    /// Sampling mode last set with `setSamplingFsMode`.
    pub fn sampling_mode(&self) -> &str {
        &self.sampling_mode
    }

    /// Advance the sweep engine to the current instant.
    fn refresh(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let run = Duration::from_secs_f64(active.sweep.initial_wait + active.sweep.duration);
        if active.triggered_at.elapsed() < self.trigger_lag + run {
            return;
        }
        if let Some(finished) = self.active.take() {
            self.complete(&finished.sweep);
        }
    }

    fn complete(&mut self, sweep: &ProgrammedSweep) {
        let samples = self.sample_count(sweep.duration);
        let mut channels = Vec::with_capacity(sweep.channels.len());
        for programmed in &sweep.channels {
            let output = waveform(programmed, samples);
            let mut input = Vec::with_capacity(samples);
            let mut x = Vec::with_capacity(samples);
            let mut y = Vec::with_capacity(samples);
            for setpoint in &output {
                let response = setpoint * 0.5 + self.rng.gen_range(-1e-6..1e-6);
                input.push(response);
                x.push(response * 0.98 + self.rng.gen_range(-1e-7..1e-7));
                y.push(self.rng.gen_range(-1e-7..1e-7));
            }
            channels.push(json!({
                "Channel": programmed.channel,
                "Input": input,
                "Output": output,
                "X": x,
                "Y": y,
            }));

            let rest = if sweep.return_to_start {
                programmed.start
            } else {
                programmed.end
            };
            self.ao[programmed.channel - 1].dc = rest;
        }
        self.waveforms = Some(json!({ "Channels": channels }));
        self.state = DeviceState::Idle;
    }

    fn reported_state(&self) -> DeviceState {
        if let Some(forced) = self.forced_state {
            return forced;
        }
        match &self.active {
            Some(active) if active.triggered_at.elapsed() < self.trigger_lag => active.prior_state,
            Some(_) => DeviceState::Sweeping,
            None => self.state,
        }
    }

    fn ao_index(value: &Value) -> Result<usize, String> {
        let channel = value
            .as_i64()
            .ok_or_else(|| format!("AO channel must be an integer, got {value}"))?;
        match usize::try_from(channel) {
            Ok(n @ 1..=AO_CHANNELS) => Ok(n - 1),
            _ => Err(format!("AO channel {channel} out of range 1-{AO_CHANNELS}")),
        }
    }

    fn clamp(&self, value: f64) -> f64 {
        match self.output_limit {
            Some(limit) => value.clamp(-limit, limit),
            None => value,
        }
    }

    fn results(&self) -> Value {
        let mut entries = Vec::new();
        for ai in 0..AI_CHANNELS {
            let overloaded = self.overloaded[ai];
            let reading = |value: f64| if overloaded { Value::Null } else { json!(value) };
            let mean = self.ao.get(ai).map_or(0.0, |c| c.dc * 0.5);
            entries.push(json!({
                "key": format!("AI{}.Mean", ai + 1),
                "value": reading(mean),
            }));
            for reference in 0..REFERENCES {
                let source = &self.ao[reference];
                let r = source.amplitude * 0.1 * (ai + 1) as f64;
                let theta = source.phase;
                let quantities = [
                    ("X", r * theta.to_radians().cos()),
                    ("Y", r * theta.to_radians().sin()),
                    ("R", r),
                    ("Theta", theta),
                ];
                for (name, value) in quantities {
                    entries.push(json!({
                        "key": format!("AI{}.Ref{}.{name}", ai + 1, reference + 1),
                        "value": reading(value),
                    }));
                }
            }
        }
        json!({ "Results (Dictionary)": entries })
    }

    fn program(&mut self, params: &Value) -> Result<(), String> {
        let duration = number(params, "Sweep Time (s)")?;
        if !(duration.is_finite() && duration > 0.0) {
            return Err(format!("Sweep Time must be positive, got {duration}"));
        }
        let initial_wait = number(params, "Initial Wait (s)")?.max(0.0);
        let return_to_start = field(params, "Return to Start")?
            .as_bool()
            .ok_or_else(|| "Return to Start must be a boolean".to_string())?;

        let mut channels = Vec::new();
        for entry in field(params, "Channels")?
            .as_array()
            .ok_or_else(|| "Channels must be a list".to_string())?
        {
            if !field(entry, "Enable?")?.as_bool().unwrap_or(false) {
                continue;
            }
            let channel = Self::ao_index(field(entry, "Channel")?)? + 1;
            let pattern_name = field(entry, "Pattern")?.as_str().unwrap_or_default();
            let pattern = SweepPattern::from_wire(pattern_name)
                .ok_or_else(|| format!("Unknown sweep pattern '{pattern_name}'"))?;
            let table: Vec<f64> = field(entry, "Table")?
                .as_array()
                .ok_or_else(|| "Table must be a list".to_string())?
                .iter()
                .filter_map(Value::as_f64)
                .collect();
            if pattern == SweepPattern::Table && table.is_empty() {
                return Err(format!("Channel {channel}: Table pattern needs setpoints"));
            }
            channels.push(ProgrammedChannel {
                channel,
                start: number(entry, "Start")?,
                end: number(entry, "End")?,
                pattern,
                table,
            });
        }
        if channels.is_empty() {
            return Err("No enabled sweep channels".to_string());
        }

        self.programmed = Some(ProgrammedSweep {
            duration,
            initial_wait,
            return_to_start,
            channels,
        });
        Ok(())
    }

    fn set_state(&mut self, requested: &str) -> Result<(), String> {
        match requested {
            "start" => {
                if self.active.is_none() {
                    self.state = DeviceState::Started;
                }
                Ok(())
            }
            "start sweep" => {
                if self.active.is_some() {
                    return Err("Already sweeping".to_string());
                }
                let sweep = self
                    .programmed
                    .clone()
                    .ok_or_else(|| "No sweep configured".to_string())?;
                self.waveforms = None;
                self.active = Some(ActiveSweep {
                    triggered_at: Instant::now(),
                    prior_state: self.state,
                    sweep,
                });
                Ok(())
            }
            "stop" => {
                self.active = None;
                self.state = DeviceState::Stopped;
                Ok(())
            }
            "idle" => {
                self.active = None;
                self.state = DeviceState::Idle;
                Ok(())
            }
            other => Err(format!("Unknown state request '{other}'")),
        }
    }
}

fn waveform(channel: &ProgrammedChannel, samples: usize) -> Vec<f64> {
    let span = channel.end - channel.start;
    (0..samples)
        .map(|i| {
            let t = if samples > 1 {
                i as f64 / (samples - 1) as f64
            } else {
                1.0
            };
            match channel.pattern {
                SweepPattern::Ramp => channel.start + span * t,
                SweepPattern::SmoothRamp => {
                    channel.start + span * (1.0 - (std::f64::consts::PI * t).cos()) / 2.0
                }
                SweepPattern::Table => {
                    let last = channel.table.len().saturating_sub(1);
                    let index = ((t * last as f64).round() as usize).min(last);
                    channel.table.get(index).copied().unwrap_or(channel.start)
                }
            }
        })
        .collect()
}

impl DeviceHandler for SimulatedLockin {
    fn handle(&mut self, method: &str, params: &Value) -> Result<Value, String> {
        if let Some(reply) = framework_reply(method, params, METHODS) {
            return reply;
        }
        self.refresh();

        match method {
            "getState" => Ok(json!(self.reported_state().as_wire())),
            "setState" => {
                let requested = field(params, "State")?
                    .as_str()
                    .ok_or_else(|| "State must be a string".to_string())?;
                self.set_state(requested)?;
                Ok(Value::Null)
            }
            "setSweep" => {
                if self.active.is_some() {
                    return Err("Cannot reconfigure while sweeping".to_string());
                }
                self.program(params)?;
                Ok(Value::Null)
            }
            "getSweepWaveforms" => self
                .waveforms
                .clone()
                .ok_or_else(|| "No completed sweep".to_string()),
            "setSweepTime" => {
                let seconds = params
                    .as_f64()
                    .ok_or_else(|| "setSweepTime expects a number".to_string())?;
                if let Some(programmed) = &mut self.programmed {
                    programmed.duration = seconds;
                }
                Ok(Value::Null)
            }
            "setSamplingFsMode" => {
                self.sampling_mode = params
                    .as_str()
                    .ok_or_else(|| "setSamplingFsMode expects a string".to_string())?
                    .to_string();
                Ok(Value::Null)
            }
            "getResults" => Ok(self.results()),
            "getAO" => {
                let index = Self::ao_index(field(params, "channel")?)?;
                let ao = &self.ao[index];
                Ok(json!({
                    "Channel": index + 1,
                    "Amplitude": ao.amplitude,
                    "DC (V)": ao.dc,
                    "Frequency (Hz)": ao.frequency,
                    "Phase (deg)": ao.phase,
                    "Function": ao.function,
                }))
            }
            "setAO_Amplitude" => {
                let index = Self::ao_index(field(params, "Channel")?)?;
                let requested = number(params, "Amplitude")?.abs();
                self.ao[index].amplitude = self.clamp(requested);
                Ok(Value::Null)
            }
            "setAO_DC" => {
                let index = Self::ao_index(field(params, "AO Channel")?)?;
                let requested = number(params, "DC (V)")?;
                self.ao[index].dc = self.clamp(requested);
                Ok(Value::Null)
            }
            "setAO_Frequency" => {
                let index = Self::ao_index(field(params, "AO Channel")?)?;
                self.ao[index].frequency = number(params, "Frequency (Hz)")?;
                Ok(Value::Null)
            }
            "setAO_Phase" => {
                let index = Self::ao_index(field(params, "AO Channel")?)?;
                self.ao[index].phase = number(params, "Phase (deg)")?;
                Ok(Value::Null)
            }
            "setAO_Function" => {
                let index = Self::ao_index(field(params, "AO Channel")?)?;
                let function = field(params, "Function")?
                    .as_str()
                    .ok_or_else(|| "Function must be a string".to_string())?;
                validator::validate(Parameter::AoFunction, function).map_err(|e| e.to_string())?;
                self.ao[index].function = function.to_string();
                Ok(Value::Null)
            }
            other => Err(format!("Method '{other}' not found")),
        }
    }
}
