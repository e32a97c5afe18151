//! Stratum v1 message types and classification.
//!
//! One JSON object per line. A parsed line is a request (has `method` and a
//! non-null `id`), a notification (has `method`, `id` null or absent), or a
//! response (no `method`, has `id`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lines longer than this are rejected and the connection closed.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    pub id: Value,

    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl StratumRequest {
    /// Params as an array slice; missing params read as empty.
    pub fn params_array(&self) -> &[Value] {
        self.params.as_ref().and_then(|p| p.as_array()).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StratumResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    /// Standard Stratum error array `[code, message, null]`.
    pub fn err(id: Value, error: StratumError) -> Self {
        Self { id, result: Some(Value::Bool(false)), error: Some(error.to_array()) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl StratumError {
    pub const UNKNOWN: i32 = 20;
    /// Also used for "stale" in Stratum v1 practice.
    pub const JOB_NOT_FOUND: i32 = 21;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn job_not_found() -> Self {
        Self::new(Self::JOB_NOT_FOUND, "Job not found")
    }

    pub fn stale_share() -> Self {
        Self::new(Self::JOB_NOT_FOUND, "Stale share")
    }

    pub fn duplicate_share() -> Self {
        Self::new(Self::DUPLICATE_SHARE, "Duplicate share")
    }

    pub fn unauthorized_worker() -> Self {
        Self::new(Self::UNAUTHORIZED, "Unauthorized worker")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn invalid_method(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("Unknown method: {}", method))
    }

    pub fn to_array(&self) -> Value {
        serde_json::json!([self.code, self.message, Value::Null])
    }
}

/// A response with a numeric id, as matched against our own requests.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub id: u64,
    pub result: Value,
    pub error: Option<Value>,
}

impl RpcReply {
    pub fn is_error(&self) -> bool {
        self.error.as_ref().map(|e| !e.is_null()).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Request(StratumRequest),
    Response(RpcReply),
    Notification(Notification),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("not a JSON object")]
    NotAnObject,
    #[error("message has neither method nor id")]
    Unclassifiable,
    #[error("response id is not numeric: {0}")]
    NonNumericResponseId(Value),
    #[error("invalid request: {0}")]
    BadRequest(#[from] serde_json::Error),
}

/// Classify one parsed line into request / response / notification.
pub fn classify(value: Value) -> Result<Inbound, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }

    let has_method = value.get("method").and_then(|m| m.as_str()).is_some();
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    if has_method {
        if id.is_null() {
            let method = value["method"].as_str().unwrap_or_default().to_string();
            let params = value
                .get("params")
                .and_then(|p| p.as_array())
                .cloned()
                .unwrap_or_default();
            return Ok(Inbound::Notification(Notification { method, params }));
        }
        let request: StratumRequest = serde_json::from_value(value)?;
        return Ok(Inbound::Request(request));
    }

    if id.is_null() {
        return Err(ProtocolError::Unclassifiable);
    }

    let numeric = id.as_u64().ok_or(ProtocolError::NonNumericResponseId(id))?;
    Ok(Inbound::Response(RpcReply {
        id: numeric,
        result: value.get("result").cloned().unwrap_or(Value::Null),
        error: value.get("error").filter(|e| !e.is_null()).cloned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_request() {
        let v = json!({"id": 1, "method": "mining.subscribe", "params": ["agent"]});
        match classify(v).unwrap() {
            Inbound::Request(r) => {
                assert_eq!(r.method, "mining.subscribe");
                assert_eq!(r.params_array().len(), 1);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn classifies_notification_with_null_and_absent_id() {
        for v in [
            json!({"id": null, "method": "mining.notify", "params": []}),
            json!({"method": "mining.set_difficulty", "params": [8.0]}),
        ] {
            match classify(v).unwrap() {
                Inbound::Notification(_) => {}
                other => panic!("expected notification, got {:?}", other),
            }
        }
    }

    #[test]
    fn classifies_response() {
        let v = json!({"id": 7, "result": true, "error": null});
        match classify(v).unwrap() {
            Inbound::Response(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.result, json!(true));
                assert!(!r.is_error());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn error_array_shape() {
        let err = StratumError::duplicate_share();
        assert_eq!(err.to_array(), json!([22, "Duplicate share", null]));
    }

    #[test]
    fn rejects_garbage() {
        assert!(classify(json!([1, 2, 3])).is_err());
        assert!(classify(json!({"foo": "bar"})).is_err());
    }
}
