//! Wire codec for linkrpc envelopes.
//!
//! Every WebSocket text frame carries one JSON object:
//!
//! ```text
//! Request:      {"id": <int|omitted>, "version": "2.0", "method": "<path>", "params": {...}}
//! Success:      {"id": <int>, "version": "2.0", "result": <any>}
//! Error:        {"id": <int>, "version": "2.0", "error": {"code": <int>, "message": <str>}}
//! ```

use crate::config::RpcConfig;
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation id of a request and its response.
pub type RequestId = i64;

/// Keyword arguments of a call.
pub type Params = Map<String, Value>;

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(default = "synthetic_code")]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

fn synthetic_code() -> i64 {
    RpcConfig::SYNTHETIC_ERROR_CODE
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Marshal free-form error text.
    ///
    /// Text that already looks like an error object (mentions a `code` field
    /// and parses as one) is forwarded as parsed. Anything else becomes a
    /// synthetic `-32000` error with the text as message.
    pub fn from_message(text: &str) -> Self {
        if text.contains("code") {
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
                if obj.get("code").is_some_and(Value::is_i64) {
                    if let Ok(parsed) = serde_json::from_value(Value::Object(obj)) {
                        return parsed;
                    }
                }
            }
        }
        Self::new(RpcConfig::SYNTHETIC_ERROR_CODE, text)
    }

    /// Marshal an error raised while serving a call.
    pub fn from_error(err: &RpcError) -> Self {
        match err {
            RpcError::Network { code, message } => Self::new(*code, message.clone()),
            RpcError::Handler(text) => Self::from_message(text),
            other => Self::from_message(&other.to_string()),
        }
    }

    /// Convert into the error a caller sees for a failed remote call.
    pub fn into_error(self) -> RpcError {
        RpcError::Network {
            code: self.code,
            message: self.message,
        }
    }
}

/// Outbound envelope. Exactly one of `method`, `result`, `error` is set.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Params>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorObject>,
}

impl<'a> Envelope<'a> {
    fn empty(id: Option<RequestId>) -> Self {
        Self {
            id,
            version: RpcConfig::VERSION,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }
}

/// Encode a request, or a notification when `id` is `None`.
pub fn encode_request(id: Option<RequestId>, method: &str, params: &Params) -> Result<String> {
    let envelope = Envelope {
        method: Some(method),
        params: Some(params),
        ..Envelope::empty(id)
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Encode the response to a call: `Ok` becomes `result`, `Err` becomes `error`.
pub fn encode_response(id: Option<RequestId>, outcome: &Result<Value>) -> Result<String> {
    match outcome {
        Ok(result) => {
            let envelope = Envelope {
                result: Some(result),
                ..Envelope::empty(id)
            };
            Ok(serde_json::to_string(&envelope)?)
        }
        Err(err) => encode_error(id, &ErrorObject::from_error(err)),
    }
}

/// Encode an error response.
pub fn encode_error(id: Option<RequestId>, error: &ErrorObject) -> Result<String> {
    let envelope = Envelope {
        error: Some(error),
        ..Envelope::empty(id)
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: Option<RequestId>,
    pub body: FrameBody,
}

/// Payload of a decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Call { method: String, params: Params },
    Result(Value),
    Error(ErrorObject),
}

impl Frame {
    /// A call that expects no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && matches!(self.body, FrameBody::Call { .. })
    }
}

/// Decode one envelope.
///
/// Fails with `InvalidJsonMessage` for malformed payloads, `RpcIdInvalid`
/// for a non-integer id and `RpcVersionInvalid` for a missing or wrong
/// version. A `null` id is treated as absent.
pub fn decode(text: &str) -> Result<Frame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| RpcError::invalid_message(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(RpcError::invalid_message("envelope must be a JSON object"));
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(id) => Some(id),
            None => return Err(RpcError::RpcIdInvalid { found: n.to_string() }),
        },
        Some(other) => {
            return Err(RpcError::RpcIdInvalid {
                found: other.to_string(),
            })
        }
    };

    match obj.get("version") {
        Some(Value::String(v)) if v == RpcConfig::VERSION => {}
        Some(other) => {
            return Err(RpcError::RpcVersionInvalid {
                found: other.to_string(),
            })
        }
        None => {
            return Err(RpcError::RpcVersionInvalid {
                found: "<missing>".to_string(),
            })
        }
    }

    // A call carries no result or error alongside its method.
    let has_error = obj.get("error").is_some_and(|e| !e.is_null());
    if obj.contains_key("method") && (has_error || obj.contains_key("result")) {
        return Err(RpcError::invalid_message(
            "envelope carries a method together with a result or error",
        ));
    }

    let body = if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Err(RpcError::invalid_message("method must be a string"));
        };
        let params = match obj.remove("params") {
            None | Some(Value::Null) => Params::new(),
            Some(Value::Object(params)) => params,
            Some(_) => return Err(RpcError::invalid_message("params must be an object")),
        };
        FrameBody::Call { method, params }
    } else if let Some(error) = obj.remove("error").filter(|e| !e.is_null()) {
        match error {
            Value::String(text) => FrameBody::Error(ErrorObject::from_message(&text)),
            obj @ Value::Object(_) => FrameBody::Error(
                serde_json::from_value(obj)
                    .map_err(|e| RpcError::invalid_message(format!("bad error object: {e}")))?,
            ),
            _ => return Err(RpcError::invalid_message("error must be an object")),
        }
    } else if let Some(result) = obj.remove("result") {
        FrameBody::Result(result)
    } else {
        return Err(RpcError::invalid_message(
            "envelope carries no method, result or error",
        ));
    };

    Ok(Frame { id, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let cases = [
            (
                Some(7),
                "dobotlink.Magician.GetPose",
                json!({"portName": "COM3", "speed": 50}),
            ),
            (None, "gui.Plugin.update", json!({"state": "idle"})),
            (Some(-3), "quit", json!({})),
            (Some(0), "plugin.start", json!({})),
            (Some(i64::MAX), "vm.plugin.status", json!({"verbose": true})),
            (Some(i64::MIN), "plugin.status", json!({"n": null})),
            (
                Some(12),
                "M1.SetPTPCmd",
                json!({"cmd": {"mode": 1, "points": [[0, 1.5], [2, -3]]}, "tags": []}),
            ),
            (Some(4), "机械臂.移动", json!({"名称": "末端", "ε": 0.25})),
        ];

        for (id, method, p) in cases {
            let p = params(p);
            let text = encode_request(id, method, &p).unwrap();
            let frame = decode(&text).unwrap();

            assert_eq!(frame.id, id, "{text}");
            assert_eq!(
                frame.body,
                FrameBody::Call {
                    method: method.to_string(),
                    params: p,
                },
                "{text}"
            );
            assert_eq!(frame.is_notification(), id.is_none());
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let cases = [
            json!(null),
            json!("bye"),
            json!(-1),
            json!([1, "two", {"three": 3}]),
            json!({"pose": {"x": 200.0, "y": -0.5}, "ok": true}),
        ];
        for (id, result) in cases.into_iter().enumerate() {
            let id = id as RequestId + 1;
            let text = encode_response(Some(id), &Ok(result.clone())).unwrap();
            let frame = decode(&text).unwrap();
            assert_eq!(frame.id, Some(id));
            assert_eq!(frame.body, FrameBody::Result(result));
        }
    }

    #[test]
    fn test_decode_rejects_call_with_result_or_error() {
        for text in [
            r#"{"id": 1, "version": "2.0", "method": "quit", "result": 1}"#,
            r#"{"id": 1, "version": "2.0", "method": "quit", "result": null}"#,
            r#"{"id": 1, "version": "2.0", "method": "quit", "error": {"code": 1}}"#,
        ] {
            let err = decode(text).unwrap_err();
            assert!(matches!(err, RpcError::InvalidJsonMessage { .. }), "{text}");
        }

        // A null error next to a method is tolerated.
        let text = r#"{"id": 1, "version": "2.0", "method": "quit", "error": null}"#;
        assert!(matches!(decode(text).unwrap().body, FrameBody::Call { .. }));
    }

    #[test]
    fn test_notification_has_no_id() {
        let text = encode_request(None, "gui.Plugin.update", &Params::new()).unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert!(raw.get("id").is_none());
        assert_eq!(raw["version"], "2.0");

        let frame = decode(&text).unwrap();
        assert!(frame.is_notification());
    }

    #[test]
    fn test_success_response_keeps_null_result() {
        let text = encode_response(Some(1), &Ok(Value::Null)).unwrap();
        assert_eq!(text, r#"{"id":1,"version":"2.0","result":null}"#);
        assert_eq!(decode(&text).unwrap().body, FrameBody::Result(Value::Null));
    }

    #[test]
    fn test_error_response_synthetic_code() {
        let text = encode_response(Some(2), &Err(RpcError::handler("motor stalled"))).unwrap();
        let frame = decode(&text).unwrap();
        assert_eq!(
            frame.body,
            FrameBody::Error(ErrorObject::new(-32000, "motor stalled"))
        );
    }

    #[test]
    fn test_error_response_structured_message_is_forwarded() {
        let err = RpcError::handler(r#"{"code": 51, "message": "port occupied"}"#);
        let text = encode_response(Some(3), &Err(err)).unwrap();
        let frame = decode(&text).unwrap();
        assert_eq!(frame.body, FrameBody::Error(ErrorObject::new(51, "port occupied")));
    }

    #[test]
    fn test_error_from_message_mentions_code_but_not_json() {
        let obj = ErrorObject::from_message("bad code path");
        assert_eq!(obj, ErrorObject::new(-32000, "bad code path"));
    }

    #[test]
    fn test_remote_error_keeps_code() {
        let err = RpcError::Network {
            code: -32601,
            message: "no such method".into(),
        };
        assert_eq!(ErrorObject::from_error(&err), ErrorObject::new(-32601, "no such method"));
    }

    #[test]
    fn test_decode_string_id_fails() {
        let err = decode(r#"{"id":"1","version":"2.0","method":"quit"}"#).unwrap_err();
        assert!(matches!(err, RpcError::RpcIdInvalid { .. }));
    }

    #[test]
    fn test_decode_fractional_id_fails() {
        let err = decode(r#"{"id":1.5,"version":"2.0","result":1}"#).unwrap_err();
        assert!(matches!(err, RpcError::RpcIdInvalid { .. }));
    }

    #[test]
    fn test_decode_wrong_version_fails() {
        let err = decode(r#"{"id":1,"version":"1.0","method":"quit"}"#).unwrap_err();
        assert!(matches!(err, RpcError::RpcVersionInvalid { .. }));

        let err = decode(r#"{"id":1,"method":"quit"}"#).unwrap_err();
        assert!(matches!(err, RpcError::RpcVersionInvalid { .. }));
    }

    #[test]
    fn test_decode_invalid_json_fails() {
        for text in ["not json", "[1,2]", r#"{"version":"2.0"}"#] {
            let err = decode(text).unwrap_err();
            assert!(matches!(err, RpcError::InvalidJsonMessage { .. }), "{text}");
        }
    }

    #[test]
    fn test_decode_null_id_is_absent() {
        let frame = decode(r#"{"id":null,"version":"2.0","error":{"code":-32700,"message":"x"}}"#)
            .unwrap();
        assert_eq!(frame.id, None);
        assert_eq!(frame.body, FrameBody::Error(ErrorObject::new(-32700, "x")));
    }

    #[test]
    fn test_decode_string_error_is_marshalled() {
        let frame = decode(r#"{"id":4,"version":"2.0","error":"device lost"}"#).unwrap();
        assert_eq!(frame.body, FrameBody::Error(ErrorObject::new(-32000, "device lost")));
    }

    #[test]
    fn test_decode_missing_params_is_empty() {
        let frame = decode(r#"{"id":5,"version":"2.0","method":"quit"}"#).unwrap();
        assert_eq!(
            frame.body,
            FrameBody::Call {
                method: "quit".into(),
                params: Params::new(),
            }
        );
    }

    #[test]
    fn test_decode_positional_params_rejected() {
        let err = decode(r#"{"id":5,"version":"2.0","method":"quit","params":[1]}"#).unwrap_err();
        assert!(matches!(err, RpcError::InvalidJsonMessage { .. }));
    }
}
