//! Framed RPC over byte streams with request/response correlation.
//!
//! The crate splits into four pieces. The wire codec turns messages into
//! length-prefixed frames and back. The call table pairs responses with the
//! call that issued them. An [`RpcChannel`] drives one connection with a
//! reader and a writer task, dispatching inbound requests through a
//! [`ServiceRegistry`] and completing pending calls as responses arrive.
//! [`RpcServer`] accepts TCP connections and runs one channel per client;
//! [`RpcClient`] is the typed calling side of the same channel.
//!
//! Channels are symmetric: both ends may call and both ends may serve. Any
//! `AsyncRead + AsyncWrite` stream works as a transport, so tests and
//! embedded setups can run entirely over [`tokio::io::duplex`].

// Import all sub modules once...
mod channel;
mod client;
mod config;
mod error;
mod protocol;
mod registry;
mod server;

mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use channel::RpcChannel;
pub use client::RpcClient;
pub use config::RpcConfig;
pub use error::{Result, RpcError};
pub use registry::{ServiceBuilder, ServiceHandler, ServiceRegistry};
pub use server::RpcServer;

pub use protocol::{CallId, ErrorCode, RpcMessage};
pub use protocol::wire;
