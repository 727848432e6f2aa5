//! snigate TLS server
//!
//! Terminates TLS from remote TLS clients and forwards the decrypted stream
//! to a local plain backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use snigate_proxy::proxy::serve;
use snigate_proxy::{Endpoint, Handshake, ListenerConfig, RouteSource};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    snigate_proxy::logging::init();

    info!("Starting snigate TLS server");

    let config = config::Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        backend_addr = %config.backend_addr,
        cert_source = ?config.cert_source,
        "Configuration loaded"
    );

    let inbound =
        Handshake::tls_server(&config.cert_source).context("Failed to load TLS certificate")?;
    let endpoint = Endpoint::new("tls-server", RouteSource::Fixed(config.backend_addr))
        .with_inbound(inbound);

    serve(ListenerConfig::new(config.listen_addr.clone()), Arc::new(endpoint))
        .await
        .with_context(|| format!("TLS server failed on {}", config.listen_addr))?;

    info!("TLS server shutdown complete");
    Ok(())
}
