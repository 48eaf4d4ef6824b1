//! Chat demo client. Type a name, then one message per line.
//!
//! Run with: cargo run --example chat_client -- ws://127.0.0.1:8080

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use wsrelay::{ClientConfig, RelayClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8080".to_string());
    let client = RelayClient::connect(ClientConfig::new(url));
    client.on("new_msg", |data| {
        let name = data["name"].as_str().unwrap_or("?");
        let text = data["text"].as_str().unwrap_or("");
        println!("{name}: {text}");
    });
    client.on("reconnect", |_| println!("(reconnected)"));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("What is your name?");
    let Some(name) = lines.next_line().await? else {
        return Ok(());
    };
    client.wait_ready().await?;

    while let Some(text) = lines.next_line().await? {
        if text.is_empty() {
            continue;
        }
        if let Err(e) = client.send("msg", json!({"name": name, "text": text})).await {
            eprintln!("not sent: {e}");
        }
    }

    client.close().await;
    Ok(())
}
