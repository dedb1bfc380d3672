//! Standalone push hub.
//!
//! Configuration comes from `AGORA_BIND_ADDR`, `AGORA_MAX_CONNECTIONS` and
//! `AGORA_BROADCAST_CAPACITY`; logging from `RUST_LOG`.

use agora_sync::server::{PushServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };
    log::info!(
        "Starting agora-hub on {} (max {} connections)",
        config.bind_addr,
        config.max_connections
    );

    let server = PushServer::new(config);
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Could not bind: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            log::info!(
                "Shutting down ({} connections served, {} rejected)",
                stats.total_connections,
                stats.rejected_connections
            );
        }
    }
}
