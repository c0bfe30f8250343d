//! Echo server demo.
//!
//! Run with `cargo run --example echo_server`, then talk to it from another
//! terminal with `cargo run --example echo_client`. The listen address can
//! be overridden through the `WIRE_RPC_ADDR` environment variable.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use wire_rpc::{RpcConfig, RpcServer, ServiceBuilder, ServiceRegistry};

#[derive(Debug, Serialize, Deserialize)]
struct EchoRequest {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoResponse {
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    env_logger::init();

    let addr = std::env::var("WIRE_RPC_ADDR").unwrap_or_else(|_| "127.0.0.1:7450".to_string());

    let mut registry = ServiceRegistry::new();
    registry.register(
        "Echo",
        ServiceBuilder::new()
            .method("Call", |req: EchoRequest| async move {
                Ok(EchoResponse { text: req.text })
            })
            .method("Reverse", |req: EchoRequest| async move {
                Ok(EchoResponse {
                    text: req.text.chars().rev().collect(),
                })
            }),
    );

    let server = RpcServer::bind(&addr, registry, RpcConfig::new()).await?;
    println!("echo server listening on {}", server.local_addr()?);

    let shutdown_handle = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("shutting down");
            shutdown_handle.shutdown();
        }
    });

    server.serve().await?;
    Ok(())
}
