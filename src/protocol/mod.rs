//! Wire-level protocol: the typed message model and the framed codec.
//!
//! [`RpcMessage`] is what travels on the wire, one message per frame; the
//! [`wire`] module turns messages into length-prefixed frames and back.

mod message;
pub mod wire;

pub use message::{CallId, ErrorCode, RpcMessage};
