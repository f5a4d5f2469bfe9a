//! Request and reply envelopes.
//!
//! Requests follow the instrument framework's JSON-RPC flavour:
//!
//! ```text
//! {"jsonrpc": "2.0", "method": "getState", "params": {}, "id": "7"}
//! ```
//!
//! A reply must carry exactly one of `result` or `error` next to the echoed
//! `id`. An `"error": null` member is treated as absent, since some servers
//! emit it on success.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{AppResult, FlexError};

/// Protocol version tag sent with every request.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Outgoing command envelope.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    jsonrpc: &'static str,
    /// Remote method name.
    pub method: &'a str,
    /// Parameter mapping, or a device-specific positional value.
    pub params: &'a Value,
    /// Request identifier, unique per connection.
    pub id: &'a str,
}

impl<'a> Request<'a> {
    /// Build an envelope for one call.
    pub fn new(method: &'a str, params: &'a Value, id: &'a str) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION,
            method,
            params,
            id,
        }
    }

    /// Serialize to a single-line frame.
    pub fn to_frame(&self) -> AppResult<String> {
        serde_json::to_string(self)
            .map_err(|e| FlexError::Protocol(format!("cannot encode request '{}': {e}", self.method)))
    }
}

/// Empty parameter mapping, sent by calls that take no arguments.
pub fn no_params() -> Value {
    Value::Object(Map::new())
}

/// Decoded reply envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Echoed identifier, if the server sent one.
    pub id: Option<String>,
    /// `Ok(result)` or `Err(message)` from the `error` member.
    pub outcome: Result<Value, String>,
}

impl Response {
    /// Parse one reply frame.
    pub fn parse(frame: &str) -> AppResult<Self> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| FlexError::Protocol(format!("unparseable reply {frame:?}: {e}")))?;
        let Value::Object(mut members) = value else {
            return Err(FlexError::Protocol(format!(
                "reply is not a JSON object: {frame:?}"
            )));
        };

        let id = members.remove("id").and_then(|id| match id {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        });

        let error = members.remove("error").filter(|e| !e.is_null());
        let outcome = match (members.remove("result"), error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(error_message(error)),
            (Some(_), Some(_)) => {
                return Err(FlexError::Protocol(format!(
                    "reply carries both result and error: {frame:?}"
                )))
            }
            (None, None) => {
                return Err(FlexError::Protocol(format!(
                    "reply carries neither result nor error: {frame:?}"
                )))
            }
        };

        Ok(Self { id, outcome })
    }

    /// Convert into the caller-facing result, mapping `error` to [`FlexError::Remote`].
    pub fn into_result(self) -> AppResult<Value> {
        self.outcome.map_err(|message| FlexError::Remote { message })
    }
}

fn error_message(error: Value) -> String {
    match error {
        Value::String(message) => message,
        Value::Object(ref members) => match members.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => error.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_carries_version_method_params_and_id() {
        let params = json!({"channel": 1});
        let frame = Request::new("getAO", &params, "42").to_frame().unwrap();
        let decoded: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            decoded,
            json!({"jsonrpc": "2.0", "method": "getAO", "params": {"channel": 1}, "id": "42"})
        );
        assert!(!frame.contains('\n'));
    }

    #[test]
    fn result_reply_decodes() {
        let response = Response::parse(r#"{"jsonrpc":"2.0","result":"idle","id":"3"}"#).unwrap();
        assert_eq!(response.id.as_deref(), Some("3"));
        assert_eq!(response.into_result().unwrap(), json!("idle"));
    }

    #[test]
    fn null_result_is_a_result() {
        let response = Response::parse(r#"{"result":null,"id":"1"}"#).unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn numeric_ids_are_normalised_to_strings() {
        let response = Response::parse(r#"{"result":1,"id":17}"#).unwrap();
        assert_eq!(response.id.as_deref(), Some("17"));
    }

    #[test]
    fn error_reply_passes_message_through() {
        let response =
            Response::parse(r#"{"error":{"code":-32601,"message":"Method not found"},"id":"1"}"#)
                .unwrap();
        match response.into_result() {
            Err(FlexError::Remote { message }) => assert_eq!(message, "Method not found"),
            other => panic!("unexpected {other:?}"),
        }

        let response = Response::parse(r#"{"error":"busy","id":"1"}"#).unwrap();
        assert_eq!(response.outcome, Err("busy".to_string()));
    }

    #[test]
    fn null_error_alongside_result_counts_as_success() {
        let response = Response::parse(r#"{"result":5,"error":null,"id":"1"}"#).unwrap();
        assert_eq!(response.outcome, Ok(json!(5)));
    }

    #[test]
    fn malformed_replies_are_protocol_errors() {
        for frame in [
            "not json",
            "[1,2,3]",
            r#"{"id":"1"}"#,
            r#"{"result":1,"error":"x","id":"1"}"#,
        ] {
            assert!(
                matches!(Response::parse(frame), Err(FlexError::Protocol(_))),
                "frame {frame:?}"
            );
        }
    }
}
