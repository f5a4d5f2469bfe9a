//! Timed hardware sweeps.
//!
//! A sweep runs on the lock-in's own sweep engine. The host only sequences
//! it, and [`SweepCoordinator`] does that as a small state machine:
//!
//! ```text
//! Idle ──busy guard──► Configuring ──setSweep──► Started ──trigger + settle──►
//!   Sweeping ──poll every `poll_interval`──► Terminal(Idle | Stopped | Error)
//!   ──getSweepWaveforms──► SweepResult
//! ```
//!
//! Device state is always read live. Nothing is cached between polls, so
//! whatever the device reports is taken as the truth.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod coordinator;
pub mod result;

pub use config::{SweepChannel, SweepConfig, SweepPattern};
pub use coordinator::{SweepCoordinator, SweepPhase};
pub use result::{ChannelWaveforms, SweepResult};

/// Default time between state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default wait between the trigger and the first poll.
pub const DEFAULT_TRIGGER_SETTLE: Duration = Duration::from_millis(500);

/// Acquisition state reported by the lock-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Not acquiring.
    Idle,
    /// Acquiring, no sweep running.
    Started,
    /// Sweep in progress.
    Sweeping,
    /// Stopped by request.
    Stopped,
    /// Device fault.
    Error,
}

impl DeviceState {
    /// Wire name (`getState` reply).
    pub fn as_wire(self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::Started => "started",
            DeviceState::Sweeping => "sweeping",
            DeviceState::Stopped => "stopped",
            DeviceState::Error => "error",
        }
    }

    /// Parse a `getState` reply, ignoring case and surrounding whitespace.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(DeviceState::Idle),
            "started" => Some(DeviceState::Started),
            "sweeping" => Some(DeviceState::Sweeping),
            "stopped" => Some(DeviceState::Stopped),
            "error" => Some(DeviceState::Error),
            _ => None,
        }
    }

    /// Whether a sweep may still be running.
    pub fn is_active(self) -> bool {
        matches!(self, DeviceState::Started | DeviceState::Sweeping)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// What to do when a sweep outlasts its timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Stop waiting and leave the device sweeping.
    #[default]
    LeaveRunning,
    /// Send `setState "stop"` before reporting the timeout.
    RequestStop,
}

/// Timing and policy knobs for [`SweepCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Time between state polls.
    pub poll_interval: Duration,
    /// Wait after the trigger before the first poll.
    pub trigger_settle: Duration,
    /// Behaviour on timeout.
    pub timeout_policy: TimeoutPolicy,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            trigger_settle: DEFAULT_TRIGGER_SETTLE,
            timeout_policy: TimeoutPolicy::LeaveRunning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for state in [
            DeviceState::Idle,
            DeviceState::Started,
            DeviceState::Sweeping,
            DeviceState::Stopped,
            DeviceState::Error,
        ] {
            assert_eq!(DeviceState::from_wire(state.as_wire()), Some(state));
        }
        assert_eq!(DeviceState::from_wire(" Sweeping\n"), Some(DeviceState::Sweeping));
        assert_eq!(DeviceState::from_wire("warming up"), None);
    }

    #[test]
    fn only_started_and_sweeping_are_active() {
        assert!(DeviceState::Started.is_active());
        assert!(DeviceState::Sweeping.is_active());
        assert!(!DeviceState::Idle.is_active());
        assert!(!DeviceState::Stopped.is_active());
        assert!(!DeviceState::Error.is_active());
    }

    #[test]
    fn default_policy_leaves_device_running() {
        assert_eq!(SweepSettings::default().timeout_policy, TimeoutPolicy::LeaveRunning);
    }
}
