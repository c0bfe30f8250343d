//! TCP accept loop and per-connection channel bookkeeping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel::pending::lock_ignore_poison;
use crate::channel::RpcChannel;
use crate::config::RpcConfig;
use crate::error::Result;
use crate::registry::ServiceRegistry;

/// Accepts connections and runs one [`RpcChannel`] per client.
///
/// The server is cheap to clone; clones share the listener, the registry,
/// and the channel map, so one handle can sit in a spawned accept loop
/// while another drives shutdown. A failure on one channel never affects
/// the others or the accept loop itself.
///
/// # Example
///
/// ```no_run
/// use wire_rpc::{RpcConfig, RpcServer, ServiceBuilder, ServiceRegistry};
///
/// # async fn example() -> wire_rpc::Result<()> {
/// let mut registry = ServiceRegistry::new();
/// registry.register(
///     "Echo",
///     ServiceBuilder::new().method("Call", |text: String| async move { Ok(text) }),
/// );
///
/// let server = RpcServer::bind("127.0.0.1:0", registry, RpcConfig::new()).await?;
/// println!("listening on {}", server.local_addr()?);
/// server.serve().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
    config: RpcConfig,
    channels: Mutex<HashMap<u64, RpcChannel>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RpcServer {
    /// Bind to `addr` and prepare to serve `registry`.
    ///
    /// Pass port 0 to let the OS pick one; the bound address is available
    /// from [`local_addr`](Self::local_addr). Nothing is accepted until
    /// [`serve`](Self::serve) or [`spawn`](Self::spawn) runs.
    pub async fn bind(addr: &str, registry: ServiceRegistry, config: RpcConfig) -> Result<Self> {
        // ---
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Ok(Self {
            inner: Arc::new(ServerInner {
                listener,
                registry: Arc::new(registry),
                config,
                channels: Mutex::new(HashMap::new()),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx: Mutex::new(Some(shutdown_rx)),
            }),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        // ---
        Ok(self.inner.listener.local_addr()?)
    }

    /// Run the accept loop until [`shutdown`](Self::shutdown) is called.
    ///
    /// Each accepted connection gets its own channel over the shared
    /// registry. A failed accept is logged and the loop continues; on
    /// shutdown every live channel is closed before this returns.
    pub async fn serve(&self) -> Result<()> {
        // ---
        let mut shutdown_rx = match lock_ignore_poison(&self.inner.shutdown_rx).take() {
            Some(rx) => rx,
            None => {
                crate::log_warn!("server: already serving or shut down");
                return Ok(());
            }
        };

        if let Ok(_addr) = self.inner.listener.local_addr() {
            crate::log_info!("server: listening on {_addr}");
        }

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = self.inner.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept_channel(stream, peer),
                    Err(err) => {
                        // One failed accept never stops the loop.
                        crate::log_error!("server: accept failed: {err}");
                    }
                },
            }
        }

        self.close_channels();
        crate::log_info!("server: stopped");
        Ok(())
    }

    /// Run the accept loop on its own task.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        // ---
        let server = self.clone();
        tokio::spawn(async move { server.serve().await })
    }

    /// Stop accepting and close every live channel.
    ///
    /// Idempotent. Calls in flight on those channels fail with
    /// [`ChannelClosed`](crate::RpcError::ChannelClosed).
    pub fn shutdown(&self) {
        // ---
        if let Some(tx) = lock_ignore_poison(&self.inner.shutdown_tx).take() {
            let _ = tx.send(());
        }
        self.close_channels();
    }

    /// Number of channels currently tracked. Closed channels are pruned
    /// lazily as new connections arrive.
    pub fn channel_count(&self) -> usize {
        // ---
        lock_ignore_poison(&self.inner.channels).len()
    }

    fn accept_channel(&self, stream: TcpStream, _peer: SocketAddr) {
        // ---
        crate::log_debug!("server: accepted connection from {_peer}");
        let channel = RpcChannel::spawn(
            stream,
            Arc::clone(&self.inner.registry),
            self.inner.config.clone(),
        );

        let mut channels = lock_ignore_poison(&self.inner.channels);
        channels.retain(|_, existing| !existing.is_closed());
        channels.insert(channel.id(), channel);
    }

    fn close_channels(&self) {
        // ---
        let channels: Vec<RpcChannel> = {
            let mut map = lock_ignore_poison(&self.inner.channels);
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.close();
        }
    }
}
