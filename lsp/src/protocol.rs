//! JSON-RPC 2.0 envelope types.
//!
//! An [`Envelope`] is one message on the wire. The session only understands
//! the envelope shape; `params` and `result` payloads stay opaque JSON.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC and LSP error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// LSP: the request was cancelled by the client.
    pub const REQUEST_CANCELLED: i64 = -32800;
    /// LSP: the document changed while the request was being served.
    pub const CONTENT_MODIFIED: i64 = -32801;
}

/// Method name of the LSP cancellation notification.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// JSON-RPC request id. Either an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Parse an id from its JSON form. Floats, null, and structured values
    /// are not valid ids.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("JSON-RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    /// `Some(Value::Null)` when the peer sent `"data": null`.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
}

/// A member that is present maps to `Some`, even when it is `null`.
fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A response carries either a result or an error, never both.
///
/// `id` is `None` only for error replies the peer could not attribute to a
/// request (for example a parse error on its side).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    pub fn err(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// One JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Envelope {
    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            Self::Response(_) => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
        }
    }
}

impl From<Request> for Envelope {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

impl From<Response> for Envelope {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

impl From<Notification> for Envelope {
    fn from(value: Notification) -> Self {
        Self::Notification(value)
    }
}

/// Params for `$/cancelRequest`.
pub(crate) fn cancel_params(id: &RequestId) -> Value {
    serde_json::json!({ "id": id.to_value() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_from_value() {
        assert_eq!(
            RequestId::from_value(&serde_json::json!(7)),
            Some(RequestId::Number(7))
        );
        assert_eq!(
            RequestId::from_value(&serde_json::json!("abc")),
            Some(RequestId::String("abc".to_string()))
        );
        assert_eq!(RequestId::from_value(&serde_json::json!(1.5)), None);
        assert_eq!(RequestId::from_value(&Value::Null), None);
        assert_eq!(RequestId::from_value(&serde_json::json!({"id": 1})), None);
    }

    #[test]
    fn test_request_id_display_distinguishes_kinds() {
        assert_eq!(RequestId::Number(1).to_string(), "1");
        assert_eq!(RequestId::from("1").to_string(), "\"1\"");
    }

    #[test]
    fn test_request_id_serde_untagged() {
        let json = serde_json::to_value(RequestId::Number(3)).unwrap();
        assert_eq!(json, serde_json::json!(3));
        let back: RequestId = serde_json::from_value(serde_json::json!("x")).unwrap();
        assert_eq!(back, RequestId::from("x"));
    }

    #[test]
    fn test_method_not_found_error() {
        let err = RpcError::method_not_found("workspace/configuration");
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert!(err.message.contains("workspace/configuration"));
        assert!(err.data.is_none());
    }

    #[test]
    fn test_rpc_error_omits_missing_data() {
        let json = serde_json::to_value(RpcError::internal("boom")).unwrap();
        assert_eq!(json["code"], codes::INTERNAL_ERROR);
        assert!(json.get("data").is_none(), "data must be omitted, not null");
    }

    #[test]
    fn test_rpc_error_keeps_explicit_null_data() {
        let explicit: RpcError =
            serde_json::from_value(serde_json::json!({"code": 1, "message": "m", "data": null}))
                .unwrap();
        assert_eq!(explicit.data, Some(Value::Null));

        let absent: RpcError =
            serde_json::from_value(serde_json::json!({"code": 1, "message": "m"})).unwrap();
        assert_eq!(absent.data, None);
    }

    #[test]
    fn test_cancel_params() {
        assert_eq!(cancel_params(&RequestId::Number(9)), serde_json::json!({"id": 9}));
    }
}
