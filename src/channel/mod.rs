//! One RPC channel per byte stream.
//!
//! A channel owns two tasks. The reader follows the frame loop: read the
//! length prefix, read the rest of the frame, decode, route, repeat. The
//! writer drains an outbound queue so concurrent callers and dispatch tasks
//! never interleave frames on the stream. Inbound requests are dispatched
//! through the shared [`ServiceRegistry`]; inbound responses and error
//! replies complete the matching entry in the channel's [`CallTable`].
//!
//! Closing is idempotent. The first close fails every outstanding call with
//! [`RpcError::ChannelClosed`] and signals both tasks; the transport is
//! then shut down from the writer task, not from the caller.

pub(crate) mod pending;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::channel::pending::CallTable;
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{wire, CallId, ErrorCode, RpcMessage};
use crate::registry::ServiceRegistry;

/// Source of channel identifiers used in log lines and server bookkeeping.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A bidirectional RPC endpoint over one byte stream.
///
/// Channels are symmetric: both sides can issue calls and both sides answer
/// the peer's requests out of their registry. Cloning is cheap and every
/// clone drives the same underlying connection.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use wire_rpc::{RpcChannel, RpcConfig, ServiceBuilder, ServiceRegistry};
///
/// # async fn example() -> wire_rpc::Result<()> {
/// let mut registry = ServiceRegistry::new();
/// registry.register(
///     "Echo",
///     ServiceBuilder::new().method("Call", |text: String| async move { Ok(text) }),
/// );
///
/// let (local, remote) = tokio::io::duplex(64 * 1024);
/// let server = RpcChannel::spawn(remote, Arc::new(registry), RpcConfig::new());
/// let client = RpcChannel::spawn(local, Arc::new(ServiceRegistry::new()), RpcConfig::new());
///
/// let reply = client.call_raw("Echo", "Call", Bytes::from("\"hi\"")).await?;
/// # let _ = (server, reply);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    calls: CallTable,
    registry: Arc<ServiceRegistry>,
    config: RpcConfig,
    write_tx: mpsc::Sender<Bytes>,
    close_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl RpcChannel {
    /// Start a channel over `stream`, spawning its reader and writer tasks.
    ///
    /// The registry answers requests arriving from the peer; a client that
    /// serves nothing passes an empty one. The channel runs until either
    /// side closes, the peer disconnects, or a malformed frame arrives.
    pub fn spawn<S>(stream: S, registry: Arc<ServiceRegistry>, config: RpcConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        // ---
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        // mpsc capacity must be at least 1.
        let (write_tx, write_rx) = mpsc::channel(config.write_queue_depth.max(1));
        let (close_tx, close_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            id,
            calls: CallTable::new(),
            registry,
            config,
            write_tx,
            close_tx,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(read_loop(Arc::clone(&inner), read_half, close_rx.clone()));
        tokio::spawn(write_loop(Arc::clone(&inner), write_half, write_rx, close_rx));

        crate::log_debug!("channel {id}: started");
        Self { inner }
    }

    /// Call `service`.`method` on the peer with an opaque payload.
    ///
    /// Applies the configured
    /// [`call_timeout`](crate::RpcConfig::call_timeout), if any.
    ///
    /// # Errors
    ///
    /// [`RpcError::ChannelClosed`] when the channel is closed or goes down
    /// before the response arrives, [`RpcError::Timeout`] when the timeout
    /// elapses, or the error the peer answered with.
    pub async fn call_raw(&self, service: &str, method: &str, payload: Bytes) -> Result<Bytes> {
        // ---
        self.do_call(service, method, payload, self.inner.config.call_timeout)
            .await
    }

    /// Like [`call_raw`](Self::call_raw) with an explicit per-call timeout.
    pub async fn call_raw_with_timeout(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        // ---
        self.do_call(service, method, payload, Some(timeout)).await
    }

    async fn do_call(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        // ---
        let (id, response_rx) = self.inner.calls.register()?;
        let request = RpcMessage::Request {
            id,
            service: service.to_string(),
            method: method.to_string(),
            payload,
        };
        let frame = match wire::encode(&request) {
            Ok(frame) => frame,
            Err(err) => {
                self.inner.calls.discard(id);
                return Err(err);
            }
        };

        if self.inner.write_tx.send(frame).await.is_err() {
            self.inner.calls.discard(id);
            return Err(RpcError::ChannelClosed);
        }
        crate::log_debug!(
            "channel {}: call {id} to {service}.{method} sent",
            self.inner.id
        );

        let received = match timeout {
            Some(limit) => match time::timeout(limit, response_rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Forget the call; a late response becomes dangling.
                    self.inner.calls.discard(id);
                    crate::log_debug!("channel {}: call {id} timed out", self.inner.id);
                    return Err(RpcError::Timeout);
                }
            },
            None => response_rx.await,
        };

        received.map_err(|_| RpcError::ChannelClosed)?
    }

    /// Close the channel.
    ///
    /// Idempotent. Every outstanding call fails with
    /// [`RpcError::ChannelClosed`] before this returns; the transport
    /// itself is shut down asynchronously by the channel's own tasks.
    pub fn close(&self) {
        // ---
        self.inner.begin_close();
    }

    /// Whether the channel has been closed or has failed.
    pub fn is_closed(&self) -> bool {
        // ---
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Identifier of this channel, unique within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }
}

impl Inner {
    /// First close wins: fail outstanding calls, then wake both I/O tasks.
    fn begin_close(&self) {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = self.calls.close();
        if drained > 0 {
            crate::log_debug!(
                "channel {}: failed {drained} outstanding calls on close",
                self.id
            );
        }
        let _ = self.close_tx.send(true);
        crate::log_debug!("channel {}: closing", self.id);
    }

    /// Answer one inbound request and queue the reply.
    ///
    /// The handler runs on its own task; a panic unwinds there and is
    /// answered with a `HandlerFailed` reply instead of stranding the
    /// caller.
    async fn dispatch(&self, id: CallId, service: String, method: String, payload: Bytes) {
        // ---
        let invocation = {
            let registry = Arc::clone(&self.registry);
            let service = service.clone();
            let method = method.clone();
            tokio::spawn(async move { registry.dispatch(&service, &method, payload).await })
        };

        let reply = match invocation.await {
            Ok(Ok(payload)) => RpcMessage::Response { id, payload },
            Ok(Err(err)) => {
                crate::log_warn!("channel {}: {service}.{method} failed: {err}", self.id);
                let (code, message) = err.reply_parts();
                RpcMessage::Error { id, code, message }
            }
            Err(join_err) => {
                crate::log_error!(
                    "channel {}: {service}.{method} panicked: {join_err}",
                    self.id
                );
                RpcMessage::Error {
                    id,
                    code: ErrorCode::HandlerFailed,
                    message: format!("{service}.{method} panicked"),
                }
            }
        };
        self.send_message(&reply).await;
    }

    /// Encode and queue one outbound message for the writer task.
    async fn send_message(&self, message: &RpcMessage) {
        // ---
        match wire::encode(message) {
            Ok(frame) => {
                if self.write_tx.send(frame).await.is_err() {
                    crate::log_debug!(
                        "channel {}: write queue closed, dropping {} for call {}",
                        self.id,
                        message.kind_name(),
                        message.id()
                    );
                }
            }
            Err(err) => crate::log_error!(
                "channel {}: failed to encode outbound {}: {err}",
                self.id,
                message.kind_name()
            ),
        }
    }
}

/// Route one decoded inbound message.
///
/// Requests are dispatched on their own task so a slow handler never stalls
/// the frame loop. Responses and error replies complete pending calls;
/// completions for unknown ids are dangling and are dropped.
fn route_inbound(inner: &Arc<Inner>, message: RpcMessage) {
    // ---
    match message {
        RpcMessage::Request {
            id,
            service,
            method,
            payload,
        } => {
            crate::log_debug!(
                "channel {}: request {id} for {service}.{method}",
                inner.id
            );
            let dispatcher = Arc::clone(inner);
            tokio::spawn(async move {
                dispatcher.dispatch(id, service, method, payload).await;
            });
        }
        RpcMessage::Response { id, payload } => {
            if !inner.calls.complete(id, Ok(payload)) {
                crate::log_debug!(
                    "channel {}: discarding dangling response for call {id}",
                    inner.id
                );
            }
        }
        RpcMessage::Error { id, code, message } => {
            if !inner.calls.complete(id, Err(RpcError::from_reply(code, message))) {
                crate::log_debug!(
                    "channel {}: discarding dangling error reply for call {id}",
                    inner.id
                );
            }
        }
    }
}

/// Frame loop: length prefix, frame contents, decode, route.
async fn read_loop<R>(inner: Arc<Inner>, mut reader: R, mut close_rx: watch::Receiver<bool>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    // ---
    crate::log_debug!("channel {}: reader task started", inner.id);
    loop {
        let frame = tokio::select! {
            _ = close_rx.changed() => break,
            result = wire::read_frame(&mut reader, inner.config.max_frame_size) => match result {
                Ok(frame) => frame,
                Err(err) => {
                    if is_clean_eof(&err) {
                        crate::log_debug!("channel {}: peer closed the connection", inner.id);
                    } else {
                        crate::log_warn!("channel {}: read failed: {err}", inner.id);
                    }
                    inner.begin_close();
                    break;
                }
            },
        };

        match wire::decode(&frame) {
            Ok(message) => route_inbound(&inner, message),
            Err(_err) => {
                // No resynchronization: one bad frame ends the channel.
                crate::log_warn!("channel {}: dropping connection: {_err}", inner.id);
                inner.begin_close();
                break;
            }
        }
    }
    crate::log_debug!("channel {}: reader task stopped", inner.id);
}

/// Drain the outbound queue onto the stream, one frame at a time.
///
/// The close signal also interrupts a write already in flight; the peer
/// never sees the rest of that frame.
async fn write_loop<W>(
    inner: Arc<Inner>,
    mut writer: W,
    mut write_rx: mpsc::Receiver<Bytes>,
    mut close_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    // ---
    crate::log_debug!("channel {}: writer task started", inner.id);
    loop {
        let frame = tokio::select! {
            _ = close_rx.changed() => break,
            frame = write_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // A peer that stops reading stalls this write indefinitely, so the
        // close signal must be able to end it mid-frame.
        tokio::select! {
            _ = close_rx.changed() => break,
            result = wire::write_frame(&mut writer, &frame) => {
                if let Err(_err) = result {
                    crate::log_warn!("channel {}: write failed: {_err}", inner.id);
                    inner.begin_close();
                    break;
                }
            }
        }
    }
    // Release senders parked on a full queue before shutdown, which can
    // itself stall on an unresponsive peer.
    drop(write_rx);
    // Send FIN so the peer's reader observes a clean end of stream.
    let _ = writer.shutdown().await;
    crate::log_debug!("channel {}: writer task stopped", inner.id);
}

fn is_clean_eof(err: &RpcError) -> bool {
    // ---
    matches!(err, RpcError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::registry::ServiceBuilder;
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncReadExt;
    use tokio::time::sleep;

    #[derive(Debug, Serialize, Deserialize)]
    struct EchoPayload {
        text: String,
    }

    fn echo_registry() -> Arc<ServiceRegistry> {
        // ---
        let mut registry = ServiceRegistry::new();
        registry.register(
            "Echo",
            ServiceBuilder::new().method("Call", |request: EchoPayload| async move { Ok(request) }),
        );
        registry.register(
            "Slow",
            ServiceBuilder::new().method("Block", |request: EchoPayload| async move {
                sleep(Duration::from_secs(30)).await;
                Ok(request)
            }),
        );
        Arc::new(registry)
    }

    fn pair(client_config: RpcConfig, registry: Arc<ServiceRegistry>) -> (RpcChannel, RpcChannel) {
        // ---
        let (client_end, server_end) = tokio::io::duplex(1024 * 1024);
        let client = RpcChannel::spawn(client_end, Arc::new(ServiceRegistry::new()), client_config);
        let server = RpcChannel::spawn(server_end, registry, RpcConfig::new());
        (client, server)
    }

    fn encode_payload(text: &str) -> Bytes {
        // ---
        Bytes::from(serde_json::to_vec(&EchoPayload { text: text.into() }).unwrap())
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        // ---
        let (client, _server) = pair(RpcConfig::new(), echo_registry());

        let reply = client
            .call_raw("Echo", "Call", encode_payload("hello"))
            .await
            .unwrap();
        let echoed: EchoPayload = serde_json::from_slice(&reply).unwrap();
        assert_eq!(echoed.text, "hello");
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_outstanding_calls() {
        // ---
        let (client, _server) = pair(RpcConfig::new(), echo_registry());

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let handle = client.clone();
            waiters.push(tokio::spawn(async move {
                handle.call_raw("Slow", "Block", encode_payload("x")).await
            }));
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(client.pending_calls(), 3);

        client.close();
        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(RpcError::ChannelClosed)));
        }

        // Second close is a no-op, and further calls fail fast.
        client.close();
        assert!(client.is_closed());
        let err = client
            .call_raw("Echo", "Call", encode_payload("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_close_releases_callers_blocked_on_a_stalled_writer() {
        // ---
        // The peer never reads: the first frame wedges the writer mid-write,
        // the second fills the queue, and the third caller parks in the
        // queue send.
        let (channel_end, _stalled_peer) = tokio::io::duplex(64);
        let config = RpcConfig::new().with_write_queue_depth(1);
        let channel = RpcChannel::spawn(channel_end, Arc::new(ServiceRegistry::new()), config);

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let caller = channel.clone();
            waiters.push(tokio::spawn(async move {
                caller
                    .call_raw("Echo", "Call", Bytes::from(vec![0x2a; 256]))
                    .await
            }));
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.pending_calls(), 3);

        channel.close();
        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("caller still blocked after close")
                .unwrap();
            assert!(matches!(result, Err(RpcError::ChannelClosed)));
        }
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_timeout_discards_pending_entry() {
        // ---
        let config = RpcConfig::new().with_call_timeout(Duration::from_millis(100));
        let (client, _server) = pair(config, echo_registry());

        let err = client
            .call_raw("Slow", "Block", encode_payload("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
        assert_eq!(client.pending_calls(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_dangling_response_is_discarded() {
        // ---
        let (mut raw, channel_end) = tokio::io::duplex(64 * 1024);
        let channel = RpcChannel::spawn(
            channel_end,
            Arc::new(ServiceRegistry::new()),
            RpcConfig::new(),
        );

        // A response nobody asked for is dropped without closing anything.
        let dangling = wire::encode(&RpcMessage::Response {
            id: 777,
            payload: Bytes::from_static(b"{}"),
        })
        .unwrap();
        wire::write_frame(&mut raw, &dangling).await.unwrap();

        // The channel still answers requests, here with an explicit error
        // reply for a service it does not have.
        let request = wire::encode(&RpcMessage::Request {
            id: 1,
            service: "Ghost".into(),
            method: "none".into(),
            payload: Bytes::new(),
        })
        .unwrap();
        wire::write_frame(&mut raw, &request).await.unwrap();

        let frame = wire::read_frame(&mut raw, wire::DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        let reply = wire::decode(&frame).unwrap();
        assert_eq!(
            reply,
            RpcMessage::Error {
                id: 1,
                code: crate::protocol::ErrorCode::UnknownService,
                message: "Ghost".into(),
            }
        );
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_bad_magic_closes_channel() {
        // ---
        let (mut raw, channel_end) = tokio::io::duplex(64 * 1024);
        let channel = RpcChannel::spawn(
            channel_end,
            Arc::new(ServiceRegistry::new()),
            RpcConfig::new(),
        );

        // Park one call so the close has something to drain.
        let caller = channel.clone();
        let waiter = tokio::spawn(async move {
            caller.call_raw("Anyone", "there", Bytes::new()).await
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.pending_calls(), 1);

        // Well-formed length, wrong magic tag.
        raw.write_all(&6u32.to_be_bytes()).await.unwrap();
        raw.write_all(b"NOPE").await.unwrap();
        raw.write_all(&[0, 0]).await.unwrap();

        // The channel tears down: its writer sends FIN, so reading from the
        // raw end eventually returns EOF.
        let mut buf = vec![0u8; 1024];
        loop {
            let n = raw.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
        }

        assert!(channel.is_closed());
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RpcError::ChannelClosed)));
    }
}
