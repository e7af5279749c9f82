//! Error taxonomy for the session core.
//!
//! Transport faults ([`ConnectError`], [`SendError`], [`TransportError`]) are
//! handled by the session itself through reconnects. Per-call faults are
//! surfaced to the caller as [`CallError`]. Decode failures
//! ([`MalformedEnvelope`]) and stray responses ([`UnmatchedResponse`]) are
//! logged and dropped.

use std::time::Duration;

use crate::protocol::{RequestId, RpcError};
use crate::types::SessionState;

/// A frame could not be decoded into an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEnvelope {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("missing or unsupported jsonrpc version")]
    UnsupportedVersion,
    #[error("id must be an integer or a string")]
    InvalidId,
    #[error("method must be a string")]
    InvalidMethod,
    #[error("notification must not carry an id")]
    NotificationWithId,
    #[error("request or notification must not carry result or error")]
    MethodWithOutcome,
    #[error("response must not carry both result and error")]
    AmbiguousResponse,
    #[error("response carries neither result nor error")]
    MissingOutcome,
    #[error("response without method is missing its id")]
    MissingId,
    #[error("successful response must have a non-null id")]
    NullIdWithResult,
    #[error("invalid error object: {0}")]
    InvalidError(String),
}

/// Opening the transport failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("connection failed: {0}")]
    Failed(String),
}

/// Writing a frame to the transport failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("transport is closed")]
    Closed,
    #[error("write failed: {0}")]
    Io(String),
}

/// Reading from the transport failed. The connection is considered lost.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport read failed: {0}")]
pub struct TransportError(pub String);

/// A response arrived for an id with no pending call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no pending call for response id {id}")]
pub struct UnmatchedResponse {
    pub id: RequestId,
}

/// Failure of a single request or notification, reported to its caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("session is not ready (state: {0})")]
    NotReady(SessionState),
    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),
    #[error("request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl CallError {
    /// The server's error object, if the server answered with one.
    #[must_use]
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

/// Session lifecycle failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("could not connect after {attempts} attempt(s): {last}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        last: ConnectError,
    },
    #[error("operation not valid in state {0}")]
    InvalidState(SessionState),
}
