//! Custom error types for the library.
//!
//! This module defines the primary error type, `FlexError`, shared by every layer
//! of the instrument stack. Using the `thiserror` crate, it provides a single
//! taxonomy for everything from an unreachable endpoint to a sweep that outlived
//! its time budget.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the endpoint could not be reached, or the connection was
//!   already closed. Fatal for the handle that produced it.
//! - **`Timeout`**: a single request received no reply in time. The caller may retry.
//! - **`Protocol`**: the reply could not be parsed, or carried neither (or both)
//!   of `result` and `error`.
//! - **`Remote`**: the device rejected a command. The message is passed through
//!   untouched and never auto-retried.
//! - **`Validation`** / **`Parse`** / **`NotFinite`**: client-side failures
//!   raised before any I/O.
//! - **`ValueConsistency`**: the device acknowledged a set but reports a
//!   different value afterwards (silently clamped or ignored). Requires operator action.
//! - **`KeyMissing`**: a reply map lacks an expected key. A key that is present
//!   with a `null` value is *not* an error; getters return `None` for it.
//! - **`Conflict`**, **`SweepTimeout`**, **`DeviceFault`**, **`InvalidSweep`**:
//!   sweep coordination failures.
//!
//! Nothing in the library retries or swallows these; they are surfaced to the
//! caller exactly as produced.

use std::time::Duration;

use thiserror::Error;

use crate::validator::{ParseError, ValidationError};

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, FlexError>;

#[derive(Error, Debug)]
pub enum FlexError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("No reply to '{method}' within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {message}")]
    Remote { message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Invalid {parameter}: {value} is not a finite number")]
    NotFinite { parameter: String, value: f64 },

    #[error("Value consistency error: requested {parameter} = {requested}, device reports {actual}")]
    ValueConsistency {
        parameter: String,
        requested: String,
        actual: String,
    },

    #[error("Key '{key}' missing from reply to '{method}'")]
    KeyMissing { method: String, key: String },

    #[error("Sweep requested while the device is already sweeping")]
    Conflict,

    #[error(
        "Sweep still {last_state} after {elapsed:?} (timeout {timeout:?}); {}",
        timeout_outcome(.stop_requested)
    )]
    SweepTimeout {
        timeout: Duration,
        elapsed: Duration,
        last_state: String,
        stop_requested: bool,
    },

    #[error("Device reported error state during {0}")]
    DeviceFault(String),

    #[error("Invalid sweep configuration: {0}")]
    InvalidSweep(String),

    #[error("{what} did not reach {target} within {timeout:?}")]
    WaitTimeout {
        what: String,
        target: String,
        timeout: Duration,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn timeout_outcome(stop_requested: &bool) -> &'static str {
    if *stop_requested {
        "stop requested"
    } else {
        "device left running"
    }
}

impl FlexError {
    /// Whether repeating the same request could plausibly succeed.
    ///
    /// Only a per-call timeout qualifies; the library itself never acts on this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlexError::Timeout { .. })
    }
}

impl From<figment::Error> for FlexError {
    fn from(err: figment::Error) -> Self {
        FlexError::Config(Box::new(err))
    }
}
