//! Chat demo server: rebroadcasts every `msg` request as `new_msg`.
//!
//! Run with: RUST_LOG=info cargo run --example chat_server
//! With Redis: REDIS_URI=redis://localhost:6379 cargo run --example chat_server --features redis

use std::sync::Arc;
use wsrelay::{RelayServer, ServerConfig, Store};

async fn open_store() -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    #[cfg(feature = "redis")]
    if let Ok(uri) = std::env::var("REDIS_URI") {
        log::info!("Using Redis at {uri}");
        return Ok(Arc::new(wsrelay::RedisStore::connect(&uri).await?));
    }
    log::info!("Using in-memory store");
    Ok(Arc::new(wsrelay::MemoryStore::new()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig {
        bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
        ..ServerConfig::default()
    };
    let server = Arc::new(RelayServer::start(config, open_store().await?).await?);
    let mut connections = server
        .take_connection_rx()
        .ok_or("connection stream already taken")?;

    loop {
        tokio::select! {
            conn = connections.recv() => {
                let Some(conn) = conn else { break };
                let server = server.clone();
                conn.on("msg", move |data| {
                    let server = server.clone();
                    let data = data.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.broadcast("new_msg", data).await {
                            log::error!("Broadcast failed: {e}");
                        }
                    });
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.close().await;
    Ok(())
}
