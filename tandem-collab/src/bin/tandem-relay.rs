//! Standalone relay: `tandem-relay [BIND_ADDR]` (default 127.0.0.1:9090).
//!
//! Log level via `RUST_LOG`, e.g. `RUST_LOG=tandem_collab=debug`.

use log::{error, info};
use tandem_collab::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }

    info!("Starting tandem relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
