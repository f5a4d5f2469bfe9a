//! Simulated Quantum Design PPMS.
//!
//! Temperature and field ramp linearly toward their setpoints at the
//! requested rate and land exactly on the target.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use super::{framework_reply, number, DeviceHandler};

const METHODS: &[&str] = &["Set Temperature", "Get Temperature", "Set Magnet", "Get Magnet"];

#[derive(Debug, Clone)]
struct Ramp {
    from: f64,
    target: f64,
    per_second: f64,
    since: Instant,
}

impl Ramp {
    fn settled(value: f64) -> Self {
        Self {
            from: value,
            target: value,
            per_second: 0.0,
            since: Instant::now(),
        }
    }

    fn value(&self) -> f64 {
        let distance = self.target - self.from;
        let travelled = self.per_second * self.since.elapsed().as_secs_f64();
        if travelled >= distance.abs() {
            self.target
        } else {
            self.from + travelled.copysign(distance)
        }
    }

    fn retarget(&mut self, target: f64, per_minute: f64) {
        *self = Self {
            from: self.value(),
            target,
            per_second: per_minute.abs() / 60.0,
            since: Instant::now(),
        };
    }
}

/// In-memory PPMS with linear temperature and field ramps.
#[derive(Debug, Clone)]
pub struct SimulatedCryostat {
    temperature: Ramp,
    field: Ramp,
    offline: bool,
}

impl Default for SimulatedCryostat {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCryostat {
    /// Settled at 300 K and zero field.
    pub fn new() -> Self {
        Self {
            temperature: Ramp::settled(300.0),
            field: Ramp::settled(0.0),
            offline: false,
        }
    }

    /// Start settled at `kelvin`.
    pub fn at_temperature(mut self, kelvin: f64) -> Self {
        self.temperature = Ramp::settled(kelvin);
        self
    }

    /// While offline the controller answers with null readings.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Time a ramp to `target` at `per_minute` takes from the current value.
    pub fn ramp_time(from: f64, target: f64, per_minute: f64) -> Duration {
        Duration::from_secs_f64((target - from).abs() / (per_minute.abs() / 60.0))
    }

    fn reading(&self, key: &str, ramp: &Ramp) -> Value {
        if self.offline {
            json!({ key: Value::Null })
        } else {
            json!({ key: ramp.value() })
        }
    }
}

fn positive_rate(params: &Value, key: &str) -> Result<f64, String> {
    let rate = number(params, key)?;
    if rate > 0.0 && rate.is_finite() {
        Ok(rate)
    } else {
        Err(format!("{key} must be positive, got {rate}"))
    }
}

impl DeviceHandler for SimulatedCryostat {
    fn handle(&mut self, method: &str, params: &Value) -> Result<Value, String> {
        if let Some(reply) = framework_reply(method, params, METHODS) {
            return reply;
        }
        match method {
            "Get Temperature" => Ok(self.reading("Temperature (K)", &self.temperature)),
            "Get Magnet" => Ok(self.reading("Field (T)", &self.field)),
            "Set Temperature" => {
                let target = number(params, "Temperature (K)")?;
                if target <= 0.0 {
                    return Err(format!("Temperature {target} K is below absolute zero"));
                }
                let rate = positive_rate(params, "Rate (K/min)")?;
                self.temperature.retarget(target, rate);
                Ok(Value::Null)
            }
            "Set Magnet" => {
                let target = number(params, "Field (T)")?;
                let rate = positive_rate(params, "Rate (T/min)")?;
                self.field.retarget(target, rate);
                Ok(Value::Null)
            }
            other => Err(format!("Method '{other}' not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn temperature_ramps_and_lands_on_target() {
        let mut ppms = SimulatedCryostat::new();
        ppms.handle(
            "Set Temperature",
            &json!({"Temperature (K)": 290.0, "Rate (K/min)": 10.0}),
        )
        .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let halfway = ppms.handle("Get Temperature", &Value::Null).unwrap();
        let kelvin = halfway["Temperature (K)"].as_f64().unwrap();
        assert!((kelvin - 295.0).abs() < 1e-6, "got {kelvin}");

        tokio::time::advance(Duration::from_secs(60)).await;
        let done = ppms.handle("Get Temperature", &Value::Null).unwrap();
        assert_eq!(done, json!({"Temperature (K)": 290.0}));
    }

    #[test]
    fn offline_controller_reports_null() {
        let mut ppms = SimulatedCryostat::new();
        ppms.set_offline(true);
        let reply = ppms.handle("Get Magnet", &Value::Null).unwrap();
        assert_eq!(reply, json!({"Field (T)": null}));
    }

    #[test]
    fn unknown_method_names_itself() {
        let mut ppms = SimulatedCryostat::new();
        let err = ppms.handle("Launch Rocket", &json!({})).unwrap_err();
        assert!(err.contains("Launch Rocket"));
    }

    #[test]
    fn ramp_time_is_distance_over_rate() {
        assert_eq!(
            SimulatedCryostat::ramp_time(300.0, 290.0, 10.0),
            Duration::from_secs(60)
        );
    }
}
