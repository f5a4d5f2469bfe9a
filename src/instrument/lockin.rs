//! Multichannel lock-in driver.
//!
//! Covers the analog outputs (AO), the demodulated results dictionary, the
//! acquisition state and the hardware sweep engine. Sweep sequencing lives in
//! [`crate::sweep::SweepCoordinator`]; this driver only issues the individual
//! commands.
//!
//! AO amplitude and DC offset are verified setters: the front panel can limit
//! outputs without reporting an error, so the value is read back after
//! [`MultichannelLockin::verify_settle`] and compared with the request.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::{
    check_readback, optional_f64, require_finite, required, required_f64, required_str,
    CommandSet, InstrumentClient,
};
use crate::error::{AppResult, FlexError};
use crate::sweep::{ChannelWaveforms, DeviceState, SweepConfig};
use crate::transport::{no_params, TransportClient};
use crate::validator::{self, Parameter};

/// Default wait between a verified set and its read-back.
pub const DEFAULT_VERIFY_SETTLE: Duration = Duration::from_millis(100);

const RESULTS_KEY: &str = "Results (Dictionary)";

/// Settings of one analog output.
#[derive(Debug, Clone, PartialEq)]
pub struct AoChannel {
    /// Output number.
    pub channel: u32,
    /// Sine amplitude in volts.
    pub amplitude: f64,
    /// DC offset in volts.
    pub dc: f64,
    /// Frequency in Hz.
    pub frequency: f64,
    /// Phase in degrees.
    pub phase: f64,
    /// Waveform: Sine, Triangle or Square.
    pub function: String,
}

impl AoChannel {
    fn from_reply(reply: &Value) -> AppResult<Self> {
        const METHOD: &str = "getAO";
        let channel = required(reply, METHOD, "Channel")?;
        let channel = channel
            .as_u64()
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| FlexError::Protocol(format!("getAO returned channel {channel}")))?;
        Ok(Self {
            channel,
            amplitude: required_f64(reply, METHOD, "Amplitude")?,
            dc: required_f64(reply, METHOD, "DC (V)")?,
            frequency: required_f64(reply, METHOD, "Frequency (Hz)")?,
            phase: required_f64(reply, METHOD, "Phase (deg)")?,
            function: required_str(reply, METHOD, "Function")?.to_string(),
        })
    }
}

/// A demodulated quantity in the results dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockinQuantity {
    /// Mean of the raw input (no reference).
    Mean,
    /// In-phase component.
    X,
    /// Quadrature component.
    Y,
    /// Magnitude.
    R,
    /// Phase.
    Theta,
}

impl LockinQuantity {
    /// Results-dictionary key for input `channel` against `reference`.
    pub fn key(self, channel: u32, reference: u32) -> String {
        match self {
            LockinQuantity::Mean => format!("AI{channel}.Mean"),
            other => format!("AI{channel}.Ref{reference}.{other}"),
        }
    }
}

impl fmt::Display for LockinQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockinQuantity::Mean => "Mean",
            LockinQuantity::X => "X",
            LockinQuantity::Y => "Y",
            LockinQuantity::R => "R",
            LockinQuantity::Theta => "Theta",
        })
    }
}

impl std::str::FromStr for LockinQuantity {
    type Err = FlexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(LockinQuantity::Mean),
            "x" => Ok(LockinQuantity::X),
            "y" => Ok(LockinQuantity::Y),
            "r" => Ok(LockinQuantity::R),
            "theta" => Ok(LockinQuantity::Theta),
            _ => Err(FlexError::Configuration(format!(
                "unknown lock-in quantity '{s}' (expected Mean, X, Y, R or Theta)"
            ))),
        }
    }
}

/// Acquisition state change requested with `setState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRequest {
    /// Start acquiring.
    Start,
    /// Run the programmed sweep.
    StartSweep,
    /// Stop acquiring (and any running sweep).
    Stop,
}

impl StateRequest {
    /// Value sent in the `State` field.
    pub fn as_wire(self) -> &'static str {
        match self {
            StateRequest::Start => "start",
            StateRequest::StartSweep => "start sweep",
            StateRequest::Stop => "stop",
        }
    }
}

/// Multichannel lock-in driver.
pub struct MultichannelLockin<'t> {
    client: InstrumentClient<'t>,
    verify_settle: Duration,
}

impl CommandSet for MultichannelLockin<'_> {
    const NAME: &'static str = "MCLockin";
    const DEFAULT_ADDRESS: &'static str = "tcp://localhost:29170";
    const COMMANDS: &'static [&'static str] = &[
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
}

impl<'t> MultichannelLockin<'t> {
    /// Bind to `transport`.
    pub fn new(transport: &'t TransportClient) -> Self {
        Self {
            client: InstrumentClient::new(transport, Self::NAME),
            verify_settle: DEFAULT_VERIFY_SETTLE,
        }
    }

    /// Change the wait before a verified setter reads back.
    pub fn with_verify_settle(mut self, settle: Duration) -> Self {
        self.verify_settle = settle;
        self
    }

    /// Wait before a verified setter reads back.
    pub fn verify_settle(&self) -> Duration {
        self.verify_settle
    }

    /// The device-independent client.
    pub fn client(&self) -> &InstrumentClient<'t> {
        &self.client
    }

    /// Current settings of AO `channel`.
    pub async fn ao(&self, channel: u32) -> AppResult<AoChannel> {
        let reply = self
            .client
            .request("getAO", json!({ "channel": channel }))
            .await?;
        AoChannel::from_reply(&reply)
    }

    async fn read_back(&self, channel: u32) -> AppResult<AoChannel> {
        tokio::time::sleep(self.verify_settle).await;
        self.ao(channel).await
    }

    /// Set the AO amplitude and confirm the device applied it.
    ///
    /// Fails with [`FlexError::ValueConsistency`] if the read-back differs,
    /// typically because the output limit clamped the request.
    #[instrument(skip(self), err)]
    pub async fn set_ao_amplitude(&self, channel: u32, amplitude: f64) -> AppResult<()> {
        require_finite("amplitude", amplitude)?;
        self.client
            .request(
                "setAO_Amplitude",
                json!({ "Channel": channel, "Amplitude": amplitude }),
            )
            .await?;
        let actual = self.read_back(channel).await?;
        check_readback("amplitude", amplitude, actual.amplitude).inspect_err(|_| {
            warn!(channel, requested = amplitude, actual = actual.amplitude, "AO amplitude not applied");
        })
    }

    /// Set the AO DC offset and confirm the device applied it.
    #[instrument(skip(self), err)]
    pub async fn set_ao_dc(&self, channel: u32, volts: f64) -> AppResult<()> {
        require_finite("DC offset", volts)?;
        self.client
            .request("setAO_DC", json!({ "AO Channel": channel, "DC (V)": volts }))
            .await?;
        let actual = self.read_back(channel).await?;
        check_readback("DC offset", volts, actual.dc).inspect_err(|_| {
            warn!(channel, requested = volts, actual = actual.dc, "AO DC offset not applied");
        })
    }

    /// Set the AO frequency in Hz.
    pub async fn set_ao_frequency(&self, channel: u32, hz: f64) -> AppResult<()> {
        require_finite("frequency", hz)?;
        self.client
            .request(
                "setAO_Frequency",
                json!({ "AO Channel": channel, "Frequency (Hz)": hz }),
            )
            .await?;
        Ok(())
    }

    /// Set the AO phase in degrees.
    pub async fn set_ao_phase(&self, channel: u32, degrees: f64) -> AppResult<()> {
        require_finite("phase", degrees)?;
        self.client
            .request(
                "setAO_Phase",
                json!({ "AO Channel": channel, "Phase (deg)": degrees }),
            )
            .await?;
        Ok(())
    }

    /// Set the AO waveform (`Sine`, `Triangle` or `Square`).
    pub async fn set_ao_function(&self, channel: u32, function: &str) -> AppResult<()> {
        validator::validate(Parameter::AoFunction, function)?;
        self.client
            .request(
                "setAO_Function",
                json!({ "AO Channel": channel, "Function": function }),
            )
            .await?;
        Ok(())
    }

    /// The whole results dictionary; null readings are `None`.
    pub async fn results(&self) -> AppResult<BTreeMap<String, Option<f64>>> {
        let reply = self.client.request("getResults", no_params()).await?;
        let entries = required(&reply, "getResults", RESULTS_KEY)?
            .as_array()
            .ok_or_else(|| FlexError::Protocol(format!("{RESULTS_KEY} is not a list")))?;

        let mut results = BTreeMap::new();
        for entry in entries {
            let key = required_str(entry, "getResults", "key")?;
            let value = optional_f64(entry, "getResults", "value")?;
            results.insert(key.to_string(), value);
        }
        Ok(results)
    }

    /// One demodulated reading.
    ///
    /// `Ok(None)` means the device reported null for the key (for example an
    /// overloaded input); a key the device does not report at all is
    /// [`FlexError::KeyMissing`].
    pub async fn lockin_result(
        &self,
        channel: u32,
        quantity: LockinQuantity,
        reference: u32,
    ) -> AppResult<Option<f64>> {
        let key = quantity.key(channel, reference);
        let mut results = self.results().await?;
        results
            .remove(&key)
            .ok_or_else(|| FlexError::KeyMissing {
                method: "getResults".into(),
                key,
            })
    }

    /// Request an acquisition state change.
    pub async fn set_state(&self, request: StateRequest) -> AppResult<()> {
        debug!(state = request.as_wire(), "Lock-in state request");
        self.client
            .request("setState", json!({ "State": request.as_wire() }))
            .await?;
        Ok(())
    }

    /// Live acquisition state.
    pub async fn state(&self) -> AppResult<DeviceState> {
        let reply = self.client.request("getState", no_params()).await?;
        let name = reply
            .as_str()
            .ok_or_else(|| FlexError::Protocol(format!("getState returned {reply}")))?;
        DeviceState::from_wire(name)
            .ok_or_else(|| FlexError::Protocol(format!("unknown device state '{name}'")))
    }

    /// Set the sweep time of the current program.
    pub async fn set_sweep_time(&self, duration: Duration) -> AppResult<()> {
        self.client
            .request("setSweepTime", json!(duration.as_secs_f64()))
            .await?;
        Ok(())
    }

    /// Set the sampling-rate mode.
    pub async fn set_sampling_mode(&self, mode: &str) -> AppResult<()> {
        self.client.request("setSamplingFsMode", json!(mode)).await?;
        Ok(())
    }

    /// Validate and upload a sweep program as one `setSweep`.
    #[instrument(skip(self, config), fields(channels = config.channels.len(), duration = ?config.duration), err)]
    pub async fn set_sweep(&self, config: &SweepConfig) -> AppResult<()> {
        config.validate()?;
        self.client.request("setSweep", config.to_wire()).await?;
        Ok(())
    }

    /// Waveforms of the last completed sweep.
    pub async fn sweep_waveforms(&self) -> AppResult<Vec<ChannelWaveforms>> {
        let reply = self.client.request("getSweepWaveforms", no_params()).await?;
        ChannelWaveforms::from_bundle(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedLockin;
    use crate::transport::{MockHandle, MockLink};
    use tracing_test::traced_test;

    fn transport(lockin: SimulatedLockin) -> (TransportClient, MockHandle<SimulatedLockin>) {
        let link = MockLink::new(lockin);
        let handle = link.handle();
        let transport =
            TransportClient::with_link("mock://lockin", Box::new(link), Duration::from_secs(1));
        (transport, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn verified_amplitude_round_trips() {
        let (transport, handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);
        lockin.set_ao_amplitude(1, 0.01).await.unwrap();
        assert_eq!(handle.call_log(), vec!["setAO_Amplitude", "getAO"]);
        assert_eq!(lockin.ao(1).await.unwrap().amplitude, 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn clamped_amplitude_is_a_consistency_error() {
        let (transport, _handle) = transport(SimulatedLockin::new().with_output_limit(0.5));
        let lockin = MultichannelLockin::new(&transport);
        match lockin.set_ao_amplitude(2, 2.0).await {
            Err(FlexError::ValueConsistency { requested, actual, .. }) => {
                assert_eq!(requested, "2");
                assert_eq!(actual, "0.5");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn clamped_dc_is_a_consistency_error() {
        let (transport, _handle) = transport(SimulatedLockin::new().with_output_limit(1.0));
        let lockin = MultichannelLockin::new(&transport);
        lockin.set_ao_dc(1, -0.5).await.unwrap();
        assert!(matches!(
            lockin.set_ao_dc(1, -3.0).await,
            Err(FlexError::ValueConsistency { .. })
        ));
        assert!(logs_contain("AO DC offset not applied"));
    }

    #[tokio::test]
    async fn invalid_function_sends_nothing() {
        let (transport, handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);
        let err = lockin.set_ao_function(1, "Sawtooth").await.unwrap_err();
        assert!(matches!(err, FlexError::Validation(_)));
        assert!(err.to_string().contains("\"Sine\""));
        assert!(handle.call_log().is_empty());

        lockin.set_ao_function(1, "Square").await.unwrap();
        assert_eq!(lockin.ao(1).await.unwrap().function, "Square");
    }

    #[tokio::test]
    async fn non_finite_ao_values_send_nothing() {
        let (transport, handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);

        assert!(matches!(
            lockin.set_ao_amplitude(1, f64::NAN).await,
            Err(FlexError::NotFinite { .. })
        ));
        assert!(matches!(
            lockin.set_ao_dc(1, f64::INFINITY).await,
            Err(FlexError::NotFinite { .. })
        ));
        assert!(matches!(
            lockin.set_ao_frequency(1, f64::NEG_INFINITY).await,
            Err(FlexError::NotFinite { .. })
        ));
        match lockin.set_ao_phase(1, f64::NAN).await {
            Err(FlexError::NotFinite { parameter, .. }) => assert_eq!(parameter, "phase"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(handle.call_log().is_empty());
    }

    #[tokio::test]
    async fn null_result_differs_from_missing_key() {
        let mut sim = SimulatedLockin::new();
        sim.set_input_overload(2, true);
        let (transport, _handle) = transport(sim);
        let lockin = MultichannelLockin::new(&transport);

        assert_eq!(
            lockin.lockin_result(2, LockinQuantity::R, 1).await.unwrap(),
            None
        );
        assert!(lockin
            .lockin_result(1, LockinQuantity::Mean, 1)
            .await
            .unwrap()
            .is_some());
        assert!(matches!(
            lockin.lockin_result(9, LockinQuantity::X, 1).await,
            Err(FlexError::KeyMissing { .. })
        ));
    }

    #[tokio::test]
    async fn frequency_phase_and_state() {
        let (transport, _handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);
        lockin.set_ao_frequency(3, 13.0).await.unwrap();
        lockin.set_ao_phase(3, 45.0).await.unwrap();
        let ao = lockin.ao(3).await.unwrap();
        assert_eq!((ao.frequency, ao.phase), (13.0, 45.0));

        assert_eq!(lockin.state().await.unwrap(), DeviceState::Idle);
        lockin.set_state(StateRequest::Start).await.unwrap();
        assert_eq!(lockin.state().await.unwrap(), DeviceState::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_time_and_sampling_mode_reach_the_device() {
        let (transport, handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);

        lockin.set_sampling_mode("Manual").await.unwrap();
        assert_eq!(handle.with_device(|d| d.sampling_mode().to_string()), "Manual");

        let config = SweepConfig::single(1, 0.0, 1.0, Duration::from_secs(2));
        lockin.set_sweep(&config).await.unwrap();
        lockin.set_sweep_time(Duration::from_secs(4)).await.unwrap();
        lockin.set_state(StateRequest::StartSweep).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(lockin.state().await.unwrap(), DeviceState::Sweeping);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(lockin.state().await.unwrap(), DeviceState::Idle);

        let waveforms = lockin.sweep_waveforms().await.unwrap();
        let expected = handle.with_device(|d| d.sample_count(4.0));
        assert_eq!(waveforms[0].len(), expected);
    }

    #[tokio::test]
    async fn invalid_sweep_is_rejected_before_io() {
        let (transport, handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);
        let config = SweepConfig::new(Duration::from_secs(1));
        assert!(matches!(
            lockin.set_sweep(&config).await,
            Err(FlexError::InvalidSweep(_))
        ));
        assert!(handle.call_log().is_empty());
    }

    #[test]
    fn result_keys() {
        assert_eq!(LockinQuantity::Mean.key(3, 1), "AI3.Mean");
        assert_eq!(LockinQuantity::Theta.key(1, 2), "AI1.Ref2.Theta");
        assert_eq!("theta".parse::<LockinQuantity>().unwrap(), LockinQuantity::Theta);
    }
}
