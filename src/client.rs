//! Typed client facade over a single channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::channel::RpcChannel;
use crate::config::RpcConfig;
use crate::error::Result;
use crate::registry::ServiceRegistry;

/// Typed RPC client bound to one connection.
///
/// Requests are serialized with serde_json before leaving and responses are
/// deserialized on arrival; the wire sees only opaque payloads. Cloning is
/// cheap and clones share the connection, so calls may be issued
/// concurrently from many tasks.
#[derive(Clone)]
pub struct RpcClient {
    channel: RpcChannel,
}

impl RpcClient {
    /// Connect to a server over TCP.
    pub async fn connect(addr: &str, config: RpcConfig) -> Result<Self> {
        // ---
        Self::connect_with_registry(addr, ServiceRegistry::new(), config).await
    }

    /// Connect over TCP while also serving `registry` to the peer.
    ///
    /// Channels are symmetric, so a client can expose services of its own
    /// for the server to call back into.
    pub async fn connect_with_registry(
        addr: &str,
        registry: ServiceRegistry,
        config: RpcConfig,
    ) -> Result<Self> {
        // ---
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::with_stream(stream, registry, config))
    }

    /// Run the client over an already-established byte stream.
    ///
    /// Anything that reads and writes bytes works here, including the
    /// in-memory pipe from [`tokio::io::duplex`].
    pub fn with_stream<S>(stream: S, registry: ServiceRegistry, config: RpcConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        // ---
        Self {
            channel: RpcChannel::spawn(stream, Arc::new(registry), config),
        }
    }

    /// Call `service`.`method` with a typed request.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use serde::Serialize;
    /// use wire_rpc::{RpcClient, RpcConfig};
    ///
    /// #[derive(Serialize)]
    /// struct AddRequest {
    ///     a: i32,
    ///     b: i32,
    /// }
    ///
    /// # async fn example() -> wire_rpc::Result<()> {
    /// let client = RpcClient::connect("127.0.0.1:9000", RpcConfig::new()).await?;
    /// let sum: i32 = client.call("Math", "add", &AddRequest { a: 2, b: 3 }).await?;
    /// # let _ = sum;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<TReq, TResp>(&self, service: &str, method: &str, request: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let payload = Bytes::from(serde_json::to_vec(request)?);
        let reply = self.channel.call_raw(service, method, payload).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Like [`call`](Self::call) with an explicit per-call timeout.
    pub async fn call_with_timeout<TReq, TResp>(
        &self,
        service: &str,
        method: &str,
        request: &TReq,
        timeout: Duration,
    ) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let payload = Bytes::from(serde_json::to_vec(request)?);
        let reply = self
            .channel
            .call_raw_with_timeout(service, method, payload, timeout)
            .await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// The underlying channel, for raw-payload calls and introspection.
    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    /// Close the connection.
    ///
    /// Idempotent; calls in flight fail with
    /// [`ChannelClosed`](crate::RpcError::ChannelClosed).
    pub fn close(&self) {
        // ---
        self.channel.close();
    }

    /// Whether the connection has been closed or has failed.
    pub fn is_closed(&self) -> bool {
        // ---
        self.channel.is_closed()
    }
}
