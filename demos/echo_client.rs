//! Echo client demo: sends one line and prints the replies.
//!
//! The first command line argument is the text to send; the server address
//! comes from `WIRE_RPC_ADDR` or defaults to the server demo's port.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use wire_rpc::{RpcClient, RpcConfig};

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
    let text = std::env::args().nth(1).unwrap_or_else(|| "hello".to_string());

    let config = RpcConfig::new().with_call_timeout(Duration::from_secs(5));
    let client = RpcClient::connect(&addr, config).await?;

    let echoed: EchoResponse = client
        .call("Echo", "Call", &EchoRequest { text: text.clone() })
        .await?;
    println!("Echo.Call    -> {}", echoed.text);

    let reversed: EchoResponse = client.call("Echo", "Reverse", &EchoRequest { text }).await?;
    println!("Echo.Reverse -> {}", reversed.text);

    client.close();
    Ok(())
}
