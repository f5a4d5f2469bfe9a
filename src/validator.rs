//! Allowed-value tables and numeric decoding for instrument parameters.
//!
//! Everything here is pure: no I/O, no clocks, no shared state. Setters in
//! [`crate::instrument`] call [`validate`] before anything is written to the
//! wire, and getters use [`parse_integer_value`] to normalise replies such as
//! `"10M"` coming back from the amplifier front panel.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configurable parameter with a fixed, device-defined set of legal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// Amplifier channel number.
    Channel,
    /// Amplifier gain.
    Gain,
    /// Amplifier input configuration.
    Input,
    /// Amplifier shunt resistance in ohms.
    Shunt,
    /// Amplifier input coupling.
    Couple,
    /// Amplifier low-pass filter.
    Filter,
    /// Lock-in analog output waveform.
    AoFunction,
}

impl Parameter {
    /// Every parameter with an allowed-value table.
    pub const ALL: [Parameter; 7] = [
        Parameter::Channel,
        Parameter::Gain,
        Parameter::Input,
        Parameter::Shunt,
        Parameter::Couple,
        Parameter::Filter,
        Parameter::AoFunction,
    ];

    /// Field name used for this parameter in device records.
    pub fn key(self) -> &'static str {
        match self {
            Parameter::Channel => "channel",
            Parameter::Gain => "gain",
            Parameter::Input => "input",
            Parameter::Shunt => "shunt",
            Parameter::Couple => "couple",
            Parameter::Filter => "filter",
            Parameter::AoFunction => "function",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A candidate or allowed parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue<'a> {
    /// Integer-valued setting (gain, shunt, channel).
    Int(i64),
    /// Enumerated text setting (input mode, coupling, ...).
    Text(&'a str),
}

impl fmt::Display for ParamValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for ParamValue<'_> {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl<'a> From<&'a str> for ParamValue<'a> {
    fn from(s: &'a str) -> Self {
        ParamValue::Text(s)
    }
}

use ParamValue::{Int, Text};

const CHANNELS: &[ParamValue<'static>] = &[
    Int(1),
    Int(2),
    Int(3),
    Int(4),
    Int(5),
    Int(6),
    Int(7),
    Int(8),
];
const GAINS: &[ParamValue<'static>] = &[Int(1), Int(10), Int(100), Int(1000)];
const INPUTS: &[ParamValue<'static>] = &[Text("OFF"), Text("SE+"), Text("SE-"), Text("DIFF")];
const SHUNTS: &[ParamValue<'static>] = &[
    Int(0),
    Int(50),
    Int(500),
    Int(5000),
    Int(50000),
    Int(10_000_000),
];
const COUPLINGS: &[ParamValue<'static>] = &[Text("AC"), Text("DC")];
const FILTERS: &[ParamValue<'static>] = &[Text("OFF"), Text("ON")];
const AO_FUNCTIONS: &[ParamValue<'static>] = &[Text("Sine"), Text("Triangle"), Text("Square")];

/// The allowed-value table for `parameter`.
pub fn allowed_values(parameter: Parameter) -> &'static [ParamValue<'static>] {
    match parameter {
        Parameter::Channel => CHANNELS,
        Parameter::Gain => GAINS,
        Parameter::Input => INPUTS,
        Parameter::Shunt => SHUNTS,
        Parameter::Couple => COUPLINGS,
        Parameter::Filter => FILTERS,
        Parameter::AoFunction => AO_FUNCTIONS,
    }
}

/// Whether `value` is a member of the allowed set for `parameter`.
///
/// Text comparison is exact (case-sensitive), matching what the devices accept.
pub fn is_allowed(parameter: Parameter, value: ParamValue<'_>) -> bool {
    allowed_values(parameter).iter().any(|allowed| *allowed == value)
}

/// Check `value` against the table, reporting the full allowed set on rejection.
pub fn validate<'a>(
    parameter: Parameter,
    value: impl Into<ParamValue<'a>>,
) -> Result<(), ValidationError> {
    let value = value.into();
    if is_allowed(parameter, value) {
        Ok(())
    } else {
        Err(ValidationError {
            parameter,
            value: value.to_string(),
            allowed: allowed_values(parameter),
        })
    }
}

/// A value was rejected by an allowed-value table. No I/O has been performed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {parameter}: {value}. Allowed values: [{}]", join_values(.allowed))]
pub struct ValidationError {
    /// Parameter that was being set.
    pub parameter: Parameter,
    /// Display form of the rejected value.
    pub value: String,
    /// The complete allowed set for `parameter`.
    pub allowed: &'static [ParamValue<'static>],
}

fn join_values(values: &[ParamValue<'_>]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A reply value could not be decoded as an integer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot convert '{input}' to a valid integer")]
pub struct ParseError {
    /// The offending input, verbatim.
    pub input: String,
}

impl ParseError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
        }
    }
}

/// Decode an integer that may carry a magnitude suffix.
///
/// A trailing `M` (either case) multiplies by 1,000,000 and a trailing `k`
/// (either case) by 1,000. Every other non-digit character is discarded, so
/// `"10 M"`, `"5k"`, `"1,000"` and `"1.5"` (as 15) all decode. A sign is
/// discarded too: the devices only report magnitudes.
///
/// A suffixed value keeps a single decimal point, so `"1.5k"` is 1,500.
///
/// Fails when no digits remain, on overflow, or when a suffixed decimal such
/// as `"1.0001k"` does not scale to a whole number.
pub fn parse_integer_with_suffix(value: &str) -> Result<i64, ParseError> {
    let trimmed = value.trim();
    let (body, multiplier) = match trimmed.chars().last() {
        Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 1_000_000_i64),
        Some('K' | 'k') => (&trimmed[..trimmed.len() - 1], 1_000_i64),
        _ => (trimmed, 1_i64),
    };

    let kept: String = body
        .chars()
        .filter(|c| c.is_ascii_digit() || (multiplier > 1 && *c == '.'))
        .collect();

    let (whole, frac) = match kept.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (kept.as_str(), ""),
    };
    if frac.contains('.') || (whole.is_empty() && frac.is_empty()) {
        return Err(ParseError::new(value));
    }

    let whole_value: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| ParseError::new(value))?
    };
    let mut total = whole_value
        .checked_mul(multiplier)
        .ok_or_else(|| ParseError::new(value))?;

    if !frac.is_empty() {
        let scale = u32::try_from(frac.len())
            .ok()
            .and_then(|digits| 10_i64.checked_pow(digits))
            .ok_or_else(|| ParseError::new(value))?;
        let frac_value: i64 = frac.parse().map_err(|_| ParseError::new(value))?;
        let scaled = frac_value
            .checked_mul(multiplier)
            .ok_or_else(|| ParseError::new(value))?;
        if scaled % scale != 0 {
            return Err(ParseError::new(value));
        }
        total = total
            .checked_add(scaled / scale)
            .ok_or_else(|| ParseError::new(value))?;
    }

    Ok(total)
}

/// Decode a JSON reply field that may be a number or a suffixed string.
pub fn parse_integer_value(value: &serde_json::Value) -> Result<i64, ParseError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
            .ok_or_else(|| ParseError::new(&n.to_string())),
        serde_json::Value::String(s) => parse_integer_with_suffix(s),
        other => Err(ParseError::new(&other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_allowed_value_is_accepted() {
        for parameter in Parameter::ALL {
            for value in allowed_values(parameter) {
                assert!(is_allowed(parameter, *value), "{parameter} {value}");
                assert!(validate(parameter, *value).is_ok());
            }
        }
    }

    #[test]
    fn rejections_report_exactly_the_allowed_set() {
        let rejected: &[(Parameter, ParamValue<'_>)] = &[
            (Parameter::Channel, Int(0)),
            (Parameter::Channel, Int(9)),
            (Parameter::Gain, Int(2)),
            (Parameter::Gain, Int(10_000)),
            (Parameter::Input, Text("se+")),
            (Parameter::Input, Text("")),
            (Parameter::Shunt, Int(5)),
            (Parameter::Shunt, Int(10_000_001)),
            (Parameter::Couple, Text("GND")),
            (Parameter::Filter, Text("on")),
            (Parameter::AoFunction, Text("Sawtooth")),
            (Parameter::Gain, Text("10")),
            (Parameter::Input, Int(1)),
        ];
        for (parameter, value) in rejected {
            assert!(!is_allowed(*parameter, *value));
            let err = validate(*parameter, *value).unwrap_err();
            assert_eq!(err.parameter, *parameter);
            assert_eq!(err.value, value.to_string());
            assert_eq!(err.allowed, allowed_values(*parameter));
        }
    }

    #[test]
    fn validation_error_names_value_and_set() {
        let err = validate(Parameter::Gain, 3_i64).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid gain: 3. Allowed values: [1, 10, 100, 1000]"
        );
        let err = validate(Parameter::Couple, "GND").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid couple: \"GND\". Allowed values: [\"AC\", \"DC\"]"
        );
    }

    #[test]
    fn suffix_parsing_table() {
        let cases: &[(&str, i64)] = &[
            ("10M", 10_000_000),
            ("10m", 10_000_000),
            ("5k", 5_000),
            ("5K", 5_000),
            ("500", 500),
            ("0", 0),
            (" 50 ", 50),
            ("10 M", 10_000_000),
            ("1,000", 1_000),
            ("1.5k", 1_500),
            ("0.5M", 500_000),
            ("x100", 100),
            ("-50", 50),
            ("1.5", 15),
            ("1.2.3", 123),
            ("10.0", 100),
        ];
        for (input, expected) in cases {
            assert_eq!(
                parse_integer_with_suffix(input),
                Ok(*expected),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn suffix_parsing_failures() {
        for input in ["abcM", "", "M", "k", "ohms", ".", ".k", "1.2.3k", "1.0001k"] {
            let err = parse_integer_with_suffix(input).unwrap_err();
            assert_eq!(err.input, input);
        }
        assert!(parse_integer_with_suffix("99999999999999999999").is_err());
        assert!(parse_integer_with_suffix("9999999999999M").is_err());
    }

    #[test]
    fn json_values_decode() {
        assert_eq!(parse_integer_value(&json!(100)), Ok(100));
        assert_eq!(parse_integer_value(&json!(100.0)), Ok(100));
        assert_eq!(parse_integer_value(&json!("10M")), Ok(10_000_000));
        assert!(parse_integer_value(&json!(1.5)).is_err());
        assert!(parse_integer_value(&json!(null)).is_err());
        assert!(parse_integer_value(&json!([1])).is_err());
    }
}
