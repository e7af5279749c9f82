//! Envelope codec: JSON-RPC 2.0 envelopes to and from frame bytes.
//!
//! Decoding classifies a frame by the presence of `id`, `method`, `result`
//! and `error`. Anything that does not fit one of the three envelope shapes
//! is a [`MalformedEnvelope`]; the decoder never panics on peer input.

use serde_json::{Map, Value};

use crate::error::MalformedEnvelope;
use crate::protocol::{
    Envelope, JSONRPC_VERSION, Notification, Request, RequestId, Response, RpcError,
};

/// Serialize an envelope to its JSON bytes.
#[must_use]
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    to_value(envelope).to_string().into_bytes()
}

/// Build the JSON object for an envelope.
#[must_use]
pub fn to_value(envelope: &Envelope) -> Value {
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));

    match envelope {
        Envelope::Request(req) => {
            obj.insert("id".into(), req.id.to_value());
            obj.insert("method".into(), Value::from(req.method.as_str()));
            if let Some(params) = &req.params {
                obj.insert("params".into(), params.clone());
            }
        }
        Envelope::Notification(notif) => {
            obj.insert("method".into(), Value::from(notif.method.as_str()));
            if let Some(params) = &notif.params {
                obj.insert("params".into(), params.clone());
            }
        }
        Envelope::Response(resp) => {
            let id = resp.id.as_ref().map_or(Value::Null, RequestId::to_value);
            obj.insert("id".into(), id);
            match &resp.outcome {
                Ok(result) => {
                    obj.insert("result".into(), result.clone());
                }
                Err(error) => {
                    obj.insert("error".into(), error_to_value(error));
                }
            }
        }
    }

    Value::Object(obj)
}

fn error_to_value(error: &RpcError) -> Value {
    let mut obj = Map::new();
    obj.insert("code".into(), Value::from(error.code));
    obj.insert("message".into(), Value::from(error.message.as_str()));
    if let Some(data) = &error.data {
        obj.insert("data".into(), data.clone());
    }
    Value::Object(obj)
}

/// Parse frame bytes into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, MalformedEnvelope> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| MalformedEnvelope::InvalidJson(e.to_string()))?;
    from_value(value)
}

/// Classify an already-parsed JSON value.
pub fn from_value(value: Value) -> Result<Envelope, MalformedEnvelope> {
    let Value::Object(mut obj) = value else {
        return Err(MalformedEnvelope::NotAnObject);
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(MalformedEnvelope::UnsupportedVersion);
    }

    let id = obj.remove("id");
    let params = obj.remove("params");

    if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Err(MalformedEnvelope::InvalidMethod);
        };
        if obj.contains_key("result") || obj.contains_key("error") {
            return Err(MalformedEnvelope::MethodWithOutcome);
        }
        return match id {
            None => Ok(Envelope::Notification(Notification { method, params })),
            Some(Value::Null) => Err(MalformedEnvelope::NotificationWithId),
            Some(raw) => {
                let id = RequestId::from_value(&raw).ok_or(MalformedEnvelope::InvalidId)?;
                Ok(Envelope::Request(Request { id, method, params }))
            }
        };
    }

    let id = match id {
        None => return Err(MalformedEnvelope::MissingId),
        Some(Value::Null) => None,
        Some(raw) => Some(RequestId::from_value(&raw).ok_or(MalformedEnvelope::InvalidId)?),
    };

    let outcome = match (obj.remove("result"), obj.remove("error")) {
        (Some(_), Some(_)) => return Err(MalformedEnvelope::AmbiguousResponse),
        (None, None) => return Err(MalformedEnvelope::MissingOutcome),
        (Some(result), None) => {
            if id.is_none() {
                return Err(MalformedEnvelope::NullIdWithResult);
            }
            Ok(result)
        }
        (None, Some(error)) => Err(serde_json::from_value::<RpcError>(error)
            .map_err(|e| MalformedEnvelope::InvalidError(e.to_string()))?),
    };

    Ok(Envelope::Response(Response { id, outcome }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_json(value: &Value) -> Result<Envelope, MalformedEnvelope> {
        decode(value.to_string().as_bytes())
    }

    #[test]
    fn test_roundtrip_each_envelope_kind() {
        let envelopes = [
            Envelope::Request(Request::new(
                RequestId::from("1"),
                "textDocument/hover",
                Some(json!({"position": {"line": 1, "character": 2}})),
            )),
            Envelope::Request(Request::new(RequestId::Number(7), "shutdown", None)),
            Envelope::Notification(Notification::new("exit", None)),
            Envelope::Notification(Notification::new("initialized", Some(json!({})))),
            Envelope::Response(Response::ok(RequestId::Number(2), Value::Null)),
            Envelope::Response(Response::ok(
                RequestId::from("1"),
                json!({"contents": "doc"}),
            )),
            Envelope::Response(Response::err(
                None,
                RpcError::new(-32700, "parse error").with_data(json!("detail")),
            )),
            Envelope::Response(Response::err(
                Some(RequestId::Number(4)),
                RpcError::new(-32603, "internal").with_data(Value::Null),
            )),
        ];

        for envelope in envelopes {
            let bytes = encode(&envelope);
            assert_eq!(decode(&bytes).unwrap(), envelope);
        }
    }

    #[test]
    fn test_encode_request_shape() {
        let value = to_value(&Envelope::Request(Request::new(
            RequestId::Number(42),
            "initialize",
            Some(json!({"rootUri": "file:///"})),
        )));
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 42);
        assert_eq!(value["method"], "initialize");
        assert!(value["params"]["rootUri"].is_string());
    }

    #[test]
    fn test_encode_omits_absent_params() {
        let value = to_value(&Envelope::Notification(Notification::new("exit", None)));
        assert!(value.get("params").is_none(), "params must be omitted, not null");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_encode_null_result_is_kept() {
        let value = to_value(&Envelope::Response(Response::ok(
            RequestId::Number(1),
            Value::Null,
        )));
        assert!(value.get("result").is_some());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_decode_request_with_string_id() {
        let envelope = decode_json(&json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "method": "workspace/configuration",
            "params": {"items": []}
        }))
        .unwrap();
        match envelope {
            Envelope::Request(req) => {
                assert_eq!(req.id, RequestId::from("abc"));
                assert_eq!(req.method, "workspace/configuration");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_response() {
        let envelope = decode_json(&json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32601, "message": "nope"}
        }))
        .unwrap();
        let Envelope::Response(resp) = envelope else {
            panic!("expected response");
        };
        assert_eq!(resp.id, Some(RequestId::Number(3)));
        assert_eq!(resp.outcome.unwrap_err().code, -32601);
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        assert!(matches!(
            decode(b"not valid json!!!"),
            Err(MalformedEnvelope::InvalidJson(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert_eq!(decode_json(&json!([1, 2])), Err(MalformedEnvelope::NotAnObject));
    }

    #[test]
    fn test_decode_rejects_missing_version() {
        assert_eq!(
            decode_json(&json!({"id": 1, "result": {}})),
            Err(MalformedEnvelope::UnsupportedVersion)
        );
        assert_eq!(
            decode_json(&json!({"jsonrpc": "1.0", "id": 1, "result": {}})),
            Err(MalformedEnvelope::UnsupportedVersion)
        );
    }

    #[test]
    fn test_decode_rejects_notification_with_null_id() {
        assert_eq!(
            decode_json(&json!({"jsonrpc": "2.0", "id": null, "method": "exit"})),
            Err(MalformedEnvelope::NotificationWithId)
        );
    }

    #[test]
    fn test_decode_rejects_result_and_error() {
        assert_eq!(
            decode_json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {},
                "error": {"code": 1, "message": "x"}
            })),
            Err(MalformedEnvelope::AmbiguousResponse)
        );
    }

    #[test]
    fn test_decode_rejects_response_without_outcome() {
        assert_eq!(
            decode_json(&json!({"jsonrpc": "2.0", "id": 1})),
            Err(MalformedEnvelope::MissingOutcome)
        );
    }

    #[test]
    fn test_decode_rejects_bare_envelope() {
        assert_eq!(
            decode_json(&json!({"jsonrpc": "2.0", "result": 1})),
            Err(MalformedEnvelope::MissingId)
        );
    }

    #[test]
    fn test_decode_rejects_structured_id() {
        assert_eq!(
            decode_json(&json!({"jsonrpc": "2.0", "id": {"n": 1}, "method": "m"})),
            Err(MalformedEnvelope::InvalidId)
        );
        assert_eq!(
            decode_json(&json!({"jsonrpc": "2.0", "id": 1.5, "result": 1})),
            Err(MalformedEnvelope::InvalidId)
        );
    }

    #[test]
    fn test_decode_rejects_non_string_method() {
        assert_eq!(
            decode_json(&json!({"jsonrpc": "2.0", "method": 5})),
            Err(MalformedEnvelope::InvalidMethod)
        );
    }

    #[test]
    fn test_decode_rejects_null_id_with_result() {
        assert_eq!(
            decode_json(&json!({"jsonrpc": "2.0", "id": null, "result": 1})),
            Err(MalformedEnvelope::NullIdWithResult)
        );
    }

    #[test]
    fn test_decode_rejects_method_with_outcome() {
        assert_eq!(
            decode_json(&json!({"jsonrpc": "2.0", "id": 1, "method": "m", "result": 1})),
            Err(MalformedEnvelope::MethodWithOutcome)
        );
        assert_eq!(
            decode_json(&json!({
                "jsonrpc": "2.0",
                "method": "m",
                "error": {"code": 1, "message": "x"}
            })),
            Err(MalformedEnvelope::MethodWithOutcome)
        );
    }

    #[test]
    fn test_decode_rejects_malformed_error_object() {
        assert!(matches!(
            decode_json(&json!({"jsonrpc": "2.0", "id": 1, "error": "bad"})),
            Err(MalformedEnvelope::InvalidError(_))
        ));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_id() -> impl Strategy<Value = RequestId> {
            prop_oneof![
                any::<i64>().prop_map(RequestId::Number),
                "[a-z0-9-]{0,12}".prop_map(RequestId::String),
            ]
        }

        fn arb_json() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::from),
                any::<i64>().prop_map(Value::from),
                ".{0,16}".prop_map(Value::from),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                        .prop_map(|m| Value::Object(m.into_iter().collect())),
                ]
            })
        }

        fn arb_error() -> impl Strategy<Value = RpcError> {
            (any::<i64>(), ".{0,24}", proptest::option::of(arb_json())).prop_map(
                |(code, message, data)| RpcError {
                    code,
                    message,
                    data,
                },
            )
        }

        fn arb_envelope() -> impl Strategy<Value = Envelope> {
            let method = "[a-zA-Z$/]{1,24}";
            prop_oneof![
                (arb_id(), method, proptest::option::of(arb_json()))
                    .prop_map(|(id, method, params)| Envelope::Request(Request { id, method, params })),
                (method, proptest::option::of(arb_json()))
                    .prop_map(|(method, params)| Envelope::Notification(Notification { method, params })),
                (arb_id(), arb_json())
                    .prop_map(|(id, result)| Envelope::Response(Response::ok(id, result))),
                (proptest::option::of(arb_id()), arb_error())
                    .prop_map(|(id, error)| Envelope::Response(Response::err(id, error))),
            ]
        }

        proptest! {
            #[test]
            fn decode_inverts_encode(envelope in arb_envelope()) {
                prop_assert_eq!(decode(&encode(&envelope)).unwrap(), envelope);
            }

            #[test]
            fn decode_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = decode(&bytes);
            }

            #[test]
            fn decode_never_panics_on_arbitrary_objects(value in arb_json()) {
                let _ = from_value(value);
            }
        }
    }
}
