//! Sweep sequencing: busy guard, configure, trigger, poll, extract.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{DeviceState, SweepConfig, SweepResult, SweepSettings, TimeoutPolicy};
use crate::error::{AppResult, FlexError};
use crate::instrument::{MultichannelLockin, StateRequest};
use crate::session::SessionContext;

/// Where a sweep is in its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    /// Checking that no sweep is running.
    Idle,
    /// Uploading the program.
    Configuring,
    /// Triggered, waiting for the device to catch up.
    Started,
    /// Polling until the device leaves the active states.
    Sweeping,
    /// Device reached a final state.
    Terminal(DeviceState),
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepPhase::Idle => f.write_str("idle"),
            SweepPhase::Configuring => f.write_str("configuring"),
            SweepPhase::Started => f.write_str("started"),
            SweepPhase::Sweeping => f.write_str("sweeping"),
            SweepPhase::Terminal(state) => write!(f, "terminal({state})"),
        }
    }
}

/// Runs timed sweeps on a lock-in.
///
/// The coordinator holds no state between calls; every decision is based on
/// the state the device reports at that moment. Two coordinators driving the
/// same device (from different tasks or processes) can both pass the busy
/// guard; callers that share a device must serialize sweeps themselves.
pub struct SweepCoordinator<'a, 't> {
    lockin: &'a MultichannelLockin<'t>,
    settings: SweepSettings,
    session: Option<&'a SessionContext>,
}

impl<'a, 't> SweepCoordinator<'a, 't> {
    /// Coordinate sweeps on `lockin` with default settings.
    pub fn new(lockin: &'a MultichannelLockin<'t>) -> Self {
        Self {
            lockin,
            settings: SweepSettings::default(),
            session: None,
        }
    }

    /// Replace the timing and timeout settings.
    pub fn with_settings(mut self, settings: SweepSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Tag log output with `session`.
    pub fn with_session(mut self, session: &'a SessionContext) -> Self {
        self.session = Some(session);
        self
    }

    /// Current settings.
    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    /// Run `config` and return the waveforms of every swept channel.
    ///
    /// `timeout` bounds the polling phase only. See
    /// [`start_sweep_for`](Self::start_sweep_for) for the error cases.
    pub async fn start_sweep(&self, config: &SweepConfig, timeout: Duration) -> AppResult<SweepResult> {
        self.run(config, timeout, None).await
    }

    /// Run `config` and return only `channel`'s waveforms.
    ///
    /// # Errors
    ///
    /// - [`FlexError::InvalidSweep`] if `config` is rejected locally (no I/O)
    /// - [`FlexError::Conflict`] if the device is already sweeping; nothing is
    ///   configured or triggered
    /// - [`FlexError::SweepTimeout`] if the device is still active `timeout`
    ///   after polling began; by default the device is left running
    /// - [`FlexError::DeviceFault`] if the device reports its error state
    /// - [`FlexError::KeyMissing`] if `channel` is not in the waveform bundle
    /// - [`FlexError::Protocol`] if the waveform arrays have unequal lengths
    /// - any transport error, unmodified
    pub async fn start_sweep_for(
        &self,
        config: &SweepConfig,
        timeout: Duration,
        channel: u32,
    ) -> AppResult<SweepResult> {
        self.run(config, timeout, Some(channel)).await
    }

    async fn run(
        &self,
        config: &SweepConfig,
        timeout: Duration,
        channel: Option<u32>,
    ) -> AppResult<SweepResult> {
        let span = info_span!(
            "sweep",
            session = self.session.map_or("-", SessionContext::id),
            device = self.lockin.client().transport().address(),
            duration = ?config.duration,
            ?timeout,
        );
        self.sequence(config, timeout, channel).instrument(span).await
    }

    async fn sequence(
        &self,
        config: &SweepConfig,
        timeout: Duration,
        channel: Option<u32>,
    ) -> AppResult<SweepResult> {
        config.validate()?;

        enter(SweepPhase::Idle);
        let state = self.lockin.state().await?;
        if state == DeviceState::Sweeping {
            warn!("Sweep refused: device already sweeping");
            return Err(FlexError::Conflict);
        }

        enter(SweepPhase::Configuring);
        self.lockin.set_sweep(config).await?;

        enter(SweepPhase::Started);
        self.lockin.set_state(StateRequest::StartSweep).await?;
        tokio::time::sleep(self.settings.trigger_settle).await;

        enter(SweepPhase::Sweeping);
        let (terminal, elapsed, polls) = self.poll_until_done(timeout).await?;
        enter(SweepPhase::Terminal(terminal));

        let channels = self.lockin.sweep_waveforms().await?;
        let result = SweepResult {
            channels,
            elapsed,
            polls,
        };
        let result = match channel {
            Some(channel) => result.restrict_to(channel)?,
            None => result,
        };
        info!(
            channels = result.channels.len(),
            samples = result.channels.first().map_or(0, |c| c.len()),
            ?elapsed,
            "Sweep complete"
        );
        Ok(result)
    }

    /// Poll until the device leaves {Started, Sweeping}.
    ///
    /// The final sleep is clipped to the remaining budget, so a timeout is
    /// reported between `timeout` and `timeout + poll_interval` after the
    /// loop starts.
    async fn poll_until_done(&self, timeout: Duration) -> AppResult<(DeviceState, Duration, u32)> {
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            let state = self.lockin.state().await?;
            polls += 1;
            let elapsed = started.elapsed();
            debug!(%state, ?elapsed, polls, "Sweep state");

            if state == DeviceState::Error {
                return Err(FlexError::DeviceFault(format!(
                    "sweep after {elapsed:?}"
                )));
            }
            if !state.is_active() {
                return Ok((state, elapsed, polls));
            }
            if elapsed >= timeout {
                return Err(self.timed_out(timeout, elapsed, state).await);
            }

            let remaining = timeout - elapsed;
            tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;
        }
    }

    async fn timed_out(&self, timeout: Duration, elapsed: Duration, state: DeviceState) -> FlexError {
        let stop_requested = match self.settings.timeout_policy {
            TimeoutPolicy::LeaveRunning => {
                warn!(?elapsed, %state, "Sweep timed out; device left running");
                false
            }
            TimeoutPolicy::RequestStop => match self.lockin.set_state(StateRequest::Stop).await {
                Ok(()) => {
                    warn!(?elapsed, %state, "Sweep timed out; stop requested");
                    true
                }
                Err(e) => {
                    warn!(?elapsed, %state, error = %e, "Sweep timed out; stop request failed");
                    false
                }
            },
        };
        FlexError::SweepTimeout {
            timeout,
            elapsed,
            last_state: state.to_string(),
            stop_requested,
        }
    }
}

fn enter(phase: SweepPhase) {
    debug!(%phase, "Sweep phase");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedLockin;
    use crate::transport::{MockHandle, MockLink, TransportClient};

    fn transport(lockin: SimulatedLockin) -> (TransportClient, MockHandle<SimulatedLockin>) {
        let link = MockLink::new(lockin);
        let handle = link.handle();
        let transport =
            TransportClient::with_link("mock://lockin", Box::new(link), Duration::from_secs(1));
        (transport, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_is_refused_without_side_effects() {
        let mut sim = SimulatedLockin::new();
        sim.force_state(Some(DeviceState::Sweeping));
        let (transport, handle) = transport(sim);
        let lockin = MultichannelLockin::new(&transport);
        let coordinator = SweepCoordinator::new(&lockin);

        let config = SweepConfig::single(1, 0.0, 1.0, Duration::from_secs(5));
        let err = coordinator
            .start_sweep(&config, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, FlexError::Conflict));
        assert_eq!(handle.call_log(), vec!["getState"]);
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_is_a_fault() {
        let (transport, handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);
        let coordinator = SweepCoordinator::new(&lockin);
        let config = SweepConfig::single(1, 0.0, 1.0, Duration::from_secs(5));

        let sweep = coordinator.start_sweep(&config, Duration::from_secs(10));
        let fault = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.with_device(|d| d.force_state(Some(DeviceState::Error)));
        };
        let (result, ()) = tokio::join!(sweep, fault);
        assert!(matches!(result, Err(FlexError::DeviceFault(_))));
        assert_eq!(handle.count("getSweepWaveforms"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_stop_policy_stops_device() {
        let (transport, handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);
        let coordinator = SweepCoordinator::new(&lockin).with_settings(SweepSettings {
            timeout_policy: TimeoutPolicy::RequestStop,
            ..SweepSettings::default()
        });
        let config = SweepConfig::single(1, 0.0, 1.0, Duration::from_secs(60));

        match coordinator.start_sweep(&config, Duration::from_secs(2)).await {
            Err(FlexError::SweepTimeout { stop_requested, .. }) => assert!(stop_requested),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handle.count("setState"), 2);
        assert_eq!(lockin.state().await.unwrap(), DeviceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_touches_nothing() {
        let (transport, handle) = transport(SimulatedLockin::new());
        let lockin = MultichannelLockin::new(&transport);
        let coordinator = SweepCoordinator::new(&lockin);
        let config = SweepConfig::new(Duration::from_secs(1));
        assert!(matches!(
            coordinator.start_sweep(&config, Duration::from_secs(1)).await,
            Err(FlexError::InvalidSweep(_))
        ));
        assert!(handle.call_log().is_empty());
    }

    #[test]
    fn phase_names() {
        assert_eq!(SweepPhase::Terminal(DeviceState::Idle).to_string(), "terminal(idle)");
        assert_eq!(SweepPhase::Configuring.to_string(), "configuring");
    }
}
