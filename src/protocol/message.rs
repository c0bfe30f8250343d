//! Typed RPC messages, carried one per frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Per-channel call identifier.
///
/// Allocated from a monotonically increasing counter on the calling side.
/// Identifiers are never reused while the call they belong to is
/// outstanding; the two directions of a channel use independent counters.
pub type CallId = u64;

/// Wire codes carried by [`RpcMessage::Error`] replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The request named a service the callee does not have.
    UnknownService,
    /// The service exists but does not provide the requested method.
    UnknownMethod,
    /// The handler ran and failed.
    HandlerFailed,
}

/// The RPC message envelope.
///
/// Channels are symmetric: either side may send a `Request` and answer the
/// peer's. Payloads are opaque byte strings; what they contain is between
/// the caller and the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcMessage {
    /// Invoke `service`.`method` on the peer with an opaque payload.
    Request {
        id: CallId,
        service: String,
        method: String,
        payload: Bytes,
    },
    /// Successful result for the request with the same `id`.
    Response { id: CallId, payload: Bytes },
    /// The request with the same `id` failed before or inside its handler.
    Error {
        id: CallId,
        code: ErrorCode,
        message: String,
    },
}

impl RpcMessage {
    /// Call identifier this message belongs to.
    pub fn id(&self) -> CallId {
        // ---
        match self {
            RpcMessage::Request { id, .. }
            | RpcMessage::Response { id, .. }
            | RpcMessage::Error { id, .. } => *id,
        }
    }

    /// Short kind name for log lines.
    pub fn kind_name(&self) -> &'static str {
        // ---
        match self {
            RpcMessage::Request { .. } => "request",
            RpcMessage::Response { .. } => "response",
            RpcMessage::Error { .. } => "error",
        }
    }
}
