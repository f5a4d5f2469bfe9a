//! Configuration loading using Figment.
//!
//! Configuration is layered:
//! 1. built-in defaults (every field has one)
//! 2. a TOML file, `config/flex.toml` unless another path is given
//! 3. environment variables prefixed with `FLEX_`, `__` separating sections
//!
//! # Environment Variable Overrides
//!
//! ```text
//! FLEX_APPLICATION__LOG_LEVEL=debug
//! FLEX_INSTRUMENTS__LOCKIN__ADDRESS=tcp://192.168.1.20:29170
//! FLEX_SWEEP__POLL_INTERVAL_MS=250
//! FLEX_SWEEP__TIMEOUT_POLICY=request_stop
//! ```
//!
//! # Example
//!
//! ```no_run
//! use flex_daq::config::FlexConfig;
//!
//! # fn main() -> flex_daq::AppResult<()> {
//! let config = FlexConfig::load()?;
//! println!("Lock-in at {}", config.instruments.lockin_address());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, FlexError};
use crate::instrument::{CommandSet, Kh7008, MultichannelLockin, Ppms, WaitSettings};
use crate::store::{CsvStore, MeasurementStore, MemoryStore};
use crate::sweep::{SweepSettings, TimeoutPolicy};
use crate::transport::{socket_address, TransportClient};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/flex.toml";
/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "FLEX_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];
const STORAGE_BACKENDS: [&str; 2] = ["memory", "csv"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlexConfig {
    /// Logging settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument endpoints
    #[serde(default)]
    pub instruments: InstrumentsConfig,
    /// Lock-in driver settings
    #[serde(default)]
    pub lockin: LockinConfig,
    /// Sweep coordination settings
    #[serde(default)]
    pub sweep: SweepSection,
    /// Cryostat set-and-wait settings
    #[serde(default)]
    pub cryostat: CryostatConfig,
    /// Record storage
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Where one instrument server lives and how to talk to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// `tcp://host:port`; the driver's default address when absent
    #[serde(default)]
    pub address: Option<String>,
    /// Per-request reply timeout
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
    /// Pause after every reply before the next request may be sent
    #[serde(default)]
    pub pacing_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: None,
            timeout_ms: default_request_timeout_ms(),
            pacing_ms: 0,
        }
    }
}

impl EndpointConfig {
    /// The configured address, or `fallback`.
    pub fn address_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.address.as_deref().unwrap_or(fallback)
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Open a transport to this endpoint.
    pub async fn connect(&self, fallback: &str) -> AppResult<TransportClient> {
        let transport = TransportClient::connect(self.address_or(fallback), self.timeout()).await?;
        Ok(transport.with_pacing(Duration::from_millis(self.pacing_ms)))
    }

    fn validate(&self, name: &str) -> AppResult<()> {
        if let Some(address) = &self.address {
            socket_address(address).map_err(|e| {
                FlexError::Configuration(format!("instruments.{name}.address: {e}"))
            })?;
        }
        if self.timeout_ms == 0 {
            return Err(FlexError::Configuration(format!(
                "instruments.{name}.timeout_ms must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// The three instrument endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentsConfig {
    /// KH7008 amplifier
    #[serde(default)]
    pub amplifier: EndpointConfig,
    /// Multichannel lock-in
    #[serde(default)]
    pub lockin: EndpointConfig,
    /// PPMS cryostat
    #[serde(default)]
    pub cryostat: EndpointConfig,
}

impl InstrumentsConfig {
    /// Resolved amplifier address.
    pub fn amplifier_address(&self) -> &str {
        self.amplifier.address_or(Kh7008::DEFAULT_ADDRESS)
    }

    /// Resolved lock-in address.
    pub fn lockin_address(&self) -> &str {
        self.lockin.address_or(MultichannelLockin::DEFAULT_ADDRESS)
    }

    /// Resolved cryostat address.
    pub fn cryostat_address(&self) -> &str {
        self.cryostat.address_or(Ppms::DEFAULT_ADDRESS)
    }
}

/// Lock-in driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockinConfig {
    /// Wait between a verified set and its read-back
    #[serde(default = "default_verify_settle_ms")]
    pub verify_settle_ms: u64,
}

impl Default for LockinConfig {
    fn default() -> Self {
        Self {
            verify_settle_ms: default_verify_settle_ms(),
        }
    }
}

impl LockinConfig {
    /// Settle time as a [`Duration`].
    pub fn verify_settle(&self) -> Duration {
        Duration::from_millis(self.verify_settle_ms)
    }
}

/// Sweep coordination settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSection {
    /// Time between state polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Wait after the trigger before the first poll
    #[serde(default = "default_trigger_settle_ms")]
    pub trigger_settle_ms: u64,
    /// Added to a sweep's own length to form its timeout
    #[serde(default = "default_timeout_margin_ms")]
    pub timeout_margin_ms: u64,
    /// What to do when a sweep times out
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            trigger_settle_ms: default_trigger_settle_ms(),
            timeout_margin_ms: default_timeout_margin_ms(),
            timeout_policy: TimeoutPolicy::default(),
        }
    }
}

impl SweepSection {
    /// Coordinator settings.
    pub fn settings(&self) -> SweepSettings {
        SweepSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            trigger_settle: Duration::from_millis(self.trigger_settle_ms),
            timeout_policy: self.timeout_policy,
        }
    }

    /// Timeout for a sweep that runs for `length` on the device.
    pub fn timeout_for(&self, length: Duration) -> Duration {
        length + Duration::from_millis(self.timeout_margin_ms)
    }
}

/// Cryostat set-and-wait settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryostatConfig {
    /// Time between readings while waiting
    #[serde(default = "default_wait_poll_ms")]
    pub poll_interval_ms: u64,
    /// Give up waiting after this many seconds
    #[serde(default = "default_wait_timeout_secs")]
    pub timeout_secs: u64,
    /// Largest accepted |reading - target|
    #[serde(default)]
    pub tolerance: f64,
}

impl Default for CryostatConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_wait_poll_ms(),
            timeout_secs: default_wait_timeout_secs(),
            tolerance: 0.0,
        }
    }
}

impl CryostatConfig {
    /// Wait settings for [`Ppms`].
    pub fn wait_settings(&self) -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_secs(self.timeout_secs),
            tolerance: self.tolerance,
        }
    }
}

/// Record storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// memory or csv
    #[serde(default = "default_backend")]
    pub backend: String,
    /// File used by the csv backend
    #[serde(default = "default_csv_path")]
    pub csv_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            csv_path: default_csv_path(),
        }
    }
}

impl StorageConfig {
    /// Open the configured store.
    pub fn open(&self) -> Box<dyn MeasurementStore> {
        match self.backend.as_str() {
            "csv" => Box::new(CsvStore::new(&self.csv_path)),
            _ => Box::new(MemoryStore::new()),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_verify_settle_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_trigger_settle_ms() -> u64 {
    500
}

fn default_timeout_margin_ms() -> u64 {
    10_000
}

fn default_wait_poll_ms() -> u64 {
    1000
}

fn default_wait_timeout_secs() -> u64 {
    600
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_csv_path() -> PathBuf {
    PathBuf::from("data/flex_records.csv")
}

impl FlexConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment.
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: FlexConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values the type system cannot.
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(FlexError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if !LOG_FORMATS.contains(&self.application.log_format.as_str()) {
            return Err(FlexError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        self.instruments.amplifier.validate("amplifier")?;
        self.instruments.lockin.validate("lockin")?;
        self.instruments.cryostat.validate("cryostat")?;

        if self.sweep.poll_interval_ms == 0 {
            return Err(FlexError::Configuration(
                "sweep.poll_interval_ms must be greater than 0".into(),
            ));
        }

        if self.cryostat.poll_interval_ms == 0 || self.cryostat.timeout_secs == 0 {
            return Err(FlexError::Configuration(
                "cryostat.poll_interval_ms and cryostat.timeout_secs must be greater than 0".into(),
            ));
        }

        if !self.cryostat.tolerance.is_finite() || self.cryostat.tolerance < 0.0 {
            return Err(FlexError::Configuration(format!(
                "Invalid cryostat.tolerance {}. Must be finite and not negative",
                self.cryostat.tolerance
            )));
        }

        if !STORAGE_BACKENDS.contains(&self.storage.backend.as_str()) {
            return Err(FlexError::Configuration(format!(
                "Invalid storage backend '{}'. Must be one of: {}",
                self.storage.backend,
                STORAGE_BACKENDS.join(", ")
            )));
        }

        Ok(())
    }
}
