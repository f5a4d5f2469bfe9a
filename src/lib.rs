//! Core library for the flex_daq instrument stack.
//!
//! Instruments (a KH7008 amplifier, a multichannel lock-in with a hardware
//! sweep engine, a PPMS cryostat) each run a small JSON-RPC server. This
//! library talks to them in strict request/reply lockstep and sequences timed
//! sweeps on the lock-in:
//!
//! - [`transport`] - one connection, one exchange at a time, with timeout
//! - [`validator`] - allowed-value tables and suffix parsing, no I/O
//! - [`instrument`] - typed drivers that validate before sending
//! - [`sweep`] - the configure, trigger, poll, extract state machine
//! - [`session`] / [`store`] - explicit session context and record storage
//! - [`sim`] - simulated devices for tests and `flexctl simulate`
//! - [`config`] / [`logging`] - figment configuration and tracing setup
//!
//! ```no_run
//! use std::time::Duration;
//! use flex_daq::instrument::MultichannelLockin;
//! use flex_daq::sweep::{SweepConfig, SweepCoordinator};
//! use flex_daq::transport::TransportClient;
//!
//! # async fn demo() -> flex_daq::AppResult<()> {
//! let transport = TransportClient::connect("tcp://localhost:29170", Duration::from_secs(5)).await?;
//! let lockin = MultichannelLockin::new(&transport);
//! let config = SweepConfig::single(2, 0.0, 0.1, Duration::from_secs(20));
//! let result = SweepCoordinator::new(&lockin)
//!     .start_sweep_for(&config, Duration::from_secs(30), 2)
//!     .await?;
//! println!("{} samples", result.channels[0].len());
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod session;
pub mod sim;
pub mod store;
pub mod sweep;
pub mod transport;
pub mod validator;

pub use error::{AppResult, FlexError};
