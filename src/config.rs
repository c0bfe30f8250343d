//! Channel tuning knobs.
//!
//! One [`RpcConfig`] is handed to every channel at creation time; servers
//! clone theirs into each accepted connection.

use std::time::Duration;

use crate::protocol::wire::DEFAULT_MAX_FRAME_SIZE;

/// Configuration shared by clients, servers, and standalone channels.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wire_rpc::RpcConfig;
///
/// let config = RpcConfig::new()
///     .with_max_frame_size(1024 * 1024)
///     .with_call_timeout(Duration::from_secs(5));
/// assert_eq!(config.max_frame_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Upper bound on the declared frame length (magic tag plus body).
    ///
    /// Frames announcing more than this are rejected before any allocation
    /// and the channel closes. Applies to inbound frames only; outbound
    /// frames are bounded by what the peer will accept.
    pub max_frame_size: usize,

    /// Per-call timeout for outbound calls, `None` to wait indefinitely.
    ///
    /// A timed-out call is dropped from the pending table; a response that
    /// arrives later is discarded as dangling. Nothing is retried and the
    /// wire format is unaffected.
    pub call_timeout: Option<Duration>,

    /// Depth of the outbound write queue feeding the writer task.
    ///
    /// Callers and dispatch tasks block once the queue is full, which is the
    /// only backpressure the channel applies.
    pub write_queue_depth: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        // ---
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            call_timeout: None,
            write_queue_depth: 64,
        }
    }
}

impl RpcConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum accepted inbound frame size in bytes.
    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the per-call timeout applied to every outbound call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set the depth of the outbound write queue.
    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_defaults() {
        // ---
        let config = RpcConfig::new();
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.write_queue_depth, 64);
    }

    #[test]
    fn test_builder_setters() {
        // ---
        let config = RpcConfig::new()
            .with_max_frame_size(512)
            .with_call_timeout(Duration::from_millis(250))
            .with_write_queue_depth(8);
        assert_eq!(config.max_frame_size, 512);
        assert_eq!(config.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.write_queue_depth, 8);
    }
}
