//! Quantum Design PPMS temperature and magnet control.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::{optional_f64, require_finite, CommandSet, InstrumentClient};
use crate::error::{AppResult, FlexError};
use crate::store::{MeasurementStore, Record};
use crate::transport::{no_params, TransportClient};

/// Store series for logged temperatures.
pub const TEMPERATURE_SERIES: &str = "ppms.temperature";
/// Store series for logged fields.
pub const FIELD_SERIES: &str = "ppms.field";

/// How set-and-wait operations poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitSettings {
    /// Time between readings.
    pub poll_interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
    /// Largest accepted |reading - target|.
    pub tolerance: f64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(600),
            tolerance: 0.0,
        }
    }
}

/// PPMS driver.
pub struct Ppms<'t> {
    client: InstrumentClient<'t>,
}

impl CommandSet for Ppms<'_> {
    const NAME: &'static str = "PPMS";
    const DEFAULT_ADDRESS: &'static str = "tcp://localhost:29270";
    const COMMANDS: &'static [&'static str] =
        &["Set Temperature", "Get Temperature", "Set Magnet", "Get Magnet"];
}

impl<'t> Ppms<'t> {
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

    /// Ramp to `kelvin` at `rate` K/min.
    #[instrument(skip(self), err)]
    pub async fn set_temperature(&self, kelvin: f64, rate: f64) -> AppResult<()> {
        require_finite("temperature", kelvin)?;
        require_finite("temperature rate", rate)?;
        self.client
            .request(
                "Set Temperature",
                json!({ "Temperature (K)": kelvin, "Rate (K/min)": rate }),
            )
            .await?;
        Ok(())
    }

    /// Current temperature in K; `None` when the controller has no reading.
    pub async fn temperature(&self) -> AppResult<Option<f64>> {
        let reply = self.client.request("Get Temperature", no_params()).await?;
        optional_f64(&reply, "Get Temperature", "Temperature (K)")
    }

    /// Ramp the magnet to `tesla` at `rate` T/min.
    #[instrument(skip(self), err)]
    pub async fn set_field(&self, tesla: f64, rate: f64) -> AppResult<()> {
        require_finite("field", tesla)?;
        require_finite("field rate", rate)?;
        self.client
            .request("Set Magnet", json!({ "Field (T)": tesla, "Rate (T/min)": rate }))
            .await?;
        Ok(())
    }

    /// Current field in T; `None` when the controller has no reading.
    pub async fn field(&self) -> AppResult<Option<f64>> {
        let reply = self.client.request("Get Magnet", no_params()).await?;
        optional_f64(&reply, "Get Magnet", "Field (T)")
    }

    /// Set the temperature and wait until it is reached.
    ///
    /// Fails with [`FlexError::WaitTimeout`] if the target is not read back
    /// within `wait.timeout`. A null reading counts as "not there yet".
    pub async fn set_temperature_and_wait(
        &self,
        kelvin: f64,
        rate: f64,
        wait: WaitSettings,
    ) -> AppResult<f64> {
        self.set_temperature(kelvin, rate).await?;
        let reached = wait_for("temperature", kelvin, "K", wait, || self.temperature()).await?;
        info!(kelvin = reached, "Temperature reached");
        Ok(reached)
    }

    /// Set the field and wait until it is reached.
    pub async fn set_field_and_wait(
        &self,
        tesla: f64,
        rate: f64,
        wait: WaitSettings,
    ) -> AppResult<f64> {
        self.set_field(tesla, rate).await?;
        let reached = wait_for("field", tesla, "T", wait, || self.field()).await?;
        info!(tesla = reached, "Field reached");
        Ok(reached)
    }

    /// Read the temperature and append it to `store`.
    pub async fn log_temperature(
        &self,
        store: &dyn MeasurementStore,
        session_id: Option<&str>,
    ) -> AppResult<Option<f64>> {
        let kelvin = self.temperature().await?;
        append(store, TEMPERATURE_SERIES, kelvin, session_id).await?;
        Ok(kelvin)
    }

    /// Read the field and append it to `store`.
    pub async fn log_field(
        &self,
        store: &dyn MeasurementStore,
        session_id: Option<&str>,
    ) -> AppResult<Option<f64>> {
        let tesla = self.field().await?;
        append(store, FIELD_SERIES, tesla, session_id).await?;
        Ok(tesla)
    }

    /// Logged temperatures between `from` and `to`, oldest first.
    ///
    /// Reads `store` only; the instrument is not contacted.
    pub async fn temperature_history(
        &self,
        store: &dyn MeasurementStore,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AppResult<Vec<(DateTime<Utc>, Option<f64>)>> {
        let rows = store.query_range(TEMPERATURE_SERIES, from, to).await?;
        Ok(rows.into_iter().map(|r| (r.timestamp, r.value)).collect())
    }
}

async fn append(
    store: &dyn MeasurementStore,
    series: &str,
    reading: Option<f64>,
    session_id: Option<&str>,
) -> AppResult<()> {
    let mut record = Record::reading(series, reading);
    if let Some(id) = session_id {
        record = record.in_session(id);
    }
    store.insert(record).await
}

async fn wait_for<F, Fut>(
    what: &str,
    target: f64,
    unit: &str,
    wait: WaitSettings,
    mut read: F,
) -> AppResult<f64>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<Option<f64>>>,
{
    let started = Instant::now();
    loop {
        let reading = read().await?;
        if let Some(value) = reading {
            if (value - target).abs() <= wait.tolerance {
                return Ok(value);
            }
        }
        let elapsed = started.elapsed();
        debug!(what, ?reading, target, ?elapsed, "Waiting for setpoint");
        if elapsed >= wait.timeout {
            return Err(FlexError::WaitTimeout {
                what: what.to_string(),
                target: format!("{target} {unit}"),
                timeout: wait.timeout,
            });
        }
        tokio::time::sleep(wait.poll_interval.min(wait.timeout - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCryostat;
    use crate::store::MemoryStore;
    use crate::transport::{MockHandle, MockLink};

    fn transport() -> (TransportClient, MockHandle<SimulatedCryostat>) {
        let link = MockLink::new(SimulatedCryostat::new());
        let handle = link.handle();
        let transport =
            TransportClient::with_link("mock://ppms", Box::new(link), Duration::from_secs(1));
        (transport, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn set_and_wait_reaches_target() {
        let (transport, handle) = transport();
        let ppms = Ppms::new(&transport);
        let start = Instant::now();
        let reached = ppms
            .set_temperature_and_wait(290.0, 10.0, WaitSettings::default())
            .await
            .unwrap();
        assert_eq!(reached, 290.0);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60) && elapsed <= Duration::from_secs(61));
        assert!(handle.count("Get Temperature") >= 60);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ramp_times_out() {
        let (transport, _handle) = transport();
        let ppms = Ppms::new(&transport);
        let wait = WaitSettings {
            timeout: Duration::from_secs(5),
            ..WaitSettings::default()
        };
        match ppms.set_field_and_wait(9.0, 0.1, wait).await {
            Err(FlexError::WaitTimeout { what, target, .. }) => {
                assert_eq!(what, "field");
                assert_eq!(target, "9 T");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_finite_setpoints_send_nothing() {
        let (transport, handle) = transport();
        let ppms = Ppms::new(&transport);
        assert!(matches!(
            ppms.set_temperature(f64::NAN, 10.0).await,
            Err(FlexError::NotFinite { .. })
        ));
        assert!(matches!(
            ppms.set_temperature(4.2, f64::INFINITY).await,
            Err(FlexError::NotFinite { .. })
        ));
        assert!(matches!(
            ppms.set_field_and_wait(f64::NAN, 0.1, WaitSettings::default()).await,
            Err(FlexError::NotFinite { .. })
        ));
        assert!(handle.call_log().is_empty());
    }

    #[tokio::test]
    async fn offline_reading_is_none() {
        let (transport, handle) = transport();
        let ppms = Ppms::new(&transport);
        handle.with_device(|d| d.set_offline(true));
        assert_eq!(ppms.temperature().await.unwrap(), None);
        assert_eq!(ppms.field().await.unwrap(), None);
    }

    #[tokio::test]
    async fn field_is_logged_to_its_own_series() {
        let (transport, _handle) = transport();
        let ppms = Ppms::new(&transport);
        let store = MemoryStore::new();
        let from = Utc::now() - chrono::Duration::seconds(1);

        let tesla = ppms.log_field(&store, Some("20250509070008")).await.unwrap();
        let to = Utc::now() + chrono::Duration::seconds(1);

        let fields = store.query_range(FIELD_SERIES, from, to).await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, tesla);
        assert_eq!(fields[0].session_id.as_deref(), Some("20250509070008"));
        assert!(ppms.temperature_history(&store, from, to).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_comes_from_the_store() {
        let (transport, handle) = transport();
        let ppms = Ppms::new(&transport);
        let store = MemoryStore::new();
        let from = Utc::now() - chrono::Duration::seconds(1);
        ppms.log_temperature(&store, Some("20250509070008")).await.unwrap();
        ppms.log_temperature(&store, None).await.unwrap();
        handle.clear_log();

        let to = Utc::now() + chrono::Duration::seconds(1);
        let history = ppms.temperature_history(&store, from, to).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].1, Some(300.0));
        assert!(handle.call_log().is_empty());
    }
}
