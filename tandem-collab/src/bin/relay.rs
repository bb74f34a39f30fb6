//! Standalone relay binary.
//!
//! ```text
//! tandem-relay [bind_addr]
//! ```
//!
//! The bind address defaults to 127.0.0.1:9090; a shared join secret can
//! be supplied via TANDEM_AUTH_TOKEN. Logging goes through env_logger,
//! so RUST_LOG=debug shows per-frame traffic.

use std::env;

use tandem_collab::server::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }
    config.auth_token = env::var("TANDEM_AUTH_TOKEN").ok();

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("relay terminated: {e}");
        std::process::exit(1);
    }
}
