//! Error taxonomy for the wire codec, channels, and servers.
//!
//! Everything the crate can fail with is a variant of [`RpcError`]. The
//! boundary between local failures and error replies received from the peer
//! is handled by [`RpcError::reply_parts`] and [`RpcError::from_reply`].

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Inbound frame did not start with the protocol magic tag.
    ///
    /// The receiving channel closes; the stream is not resynchronized.
    #[error("unknown message: frame does not carry the protocol magic tag")]
    UnknownMessage,

    /// Inbound frame body failed to deserialize into a message.
    #[error("frame parse error: {0}")]
    Parse(serde_json::Error),

    /// Declared frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },

    /// Request named a service that is not registered on the callee.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The service exists but does not provide the requested method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The remote handler ran and failed.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// Underlying transport I/O failed; the channel is closed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel closed while the operation was outstanding.
    #[error("channel closed")]
    ChannelClosed,

    /// No response arrived within the per-call timeout.
    #[error("request timed out")]
    Timeout,

    /// A typed payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Split a dispatch failure into the code and message of an error reply.
    ///
    /// Inverse of [`from_reply`](Self::from_reply) for the dedicated codes;
    /// everything else collapses into [`ErrorCode::HandlerFailed`].
    pub(crate) fn reply_parts(&self) -> (ErrorCode, String) {
        // ---
        match self {
            RpcError::UnknownService(name) => (ErrorCode::UnknownService, name.clone()),
            RpcError::UnknownMethod(name) => (ErrorCode::UnknownMethod, name.clone()),
            other => (ErrorCode::HandlerFailed, other.to_string()),
        }
    }

    /// Rebuild the caller-facing error from an inbound error reply.
    pub(crate) fn from_reply(code: ErrorCode, message: String) -> Self {
        // ---
        match code {
            ErrorCode::UnknownService => RpcError::UnknownService(message),
            ErrorCode::UnknownMethod => RpcError::UnknownMethod(message),
            ErrorCode::HandlerFailed => RpcError::Remote(message),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_reply_parts_round_trip() {
        // ---
        let err = RpcError::UnknownService("Echo".into());
        let (code, message) = err.reply_parts();
        assert_eq!(code, ErrorCode::UnknownService);

        let back = RpcError::from_reply(code, message);
        assert!(matches!(back, RpcError::UnknownService(name) if name == "Echo"));
    }

    #[test]
    fn test_handler_failures_collapse_to_remote() {
        // ---
        let err = RpcError::Timeout;
        let (code, message) = err.reply_parts();
        assert_eq!(code, ErrorCode::HandlerFailed);

        let back = RpcError::from_reply(code, message);
        assert!(matches!(back, RpcError::Remote(_)));
    }
}
