//! snigate TLS client
//!
//! Listens for plain connections from local applications and forwards each
//! one over a fresh TLS connection to the remote TLS server.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use snigate_proxy::proxy::serve;
use snigate_proxy::{Endpoint, Handshake, ListenerConfig, RouteSource, SocketGuard};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    snigate_proxy::logging::init();

    info!("Starting snigate TLS client");

    let config = config::Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        backend_addr = %config.backend_addr,
        server_name = %config.server_name,
        vpn_mode = config.vpn_mode,
        "Configuration loaded"
    );

    let outbound = Handshake::tls_client(&config.server_name)
        .context("Failed to configure TLS client")?;
    let endpoint = Endpoint::new("tls-client", RouteSource::Fixed(config.backend_addr))
        .with_outbound(outbound)
        .with_guard(SocketGuard::for_vpn_mode(config.vpn_mode));

    serve(ListenerConfig::new(config.listen_addr.clone()), Arc::new(endpoint))
        .await
        .with_context(|| format!("TLS client failed on {}", config.listen_addr))?;

    info!("TLS client shutdown complete");
    Ok(())
}
