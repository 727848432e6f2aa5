//! snigate tunnel client
//!
//! Listens for plain connections from local applications and carries each
//! one through an HTTP CONNECT proxy that authenticates the tunnel with
//! `Q-GUID`/`Q-Token` credentials.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use snigate_proxy::proxy::serve;
use snigate_proxy::{Endpoint, Handshake, ListenerConfig, RouteSource, SocketGuard};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    snigate_proxy::logging::init();

    info!("Starting snigate tunnel client");

    let config = config::Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        proxy_addr = %config.proxy_addr,
        target = %config.request.target,
        vpn_mode = config.vpn_mode,
        "Configuration loaded"
    );

    let endpoint = Endpoint::new("tunnel-client", RouteSource::Fixed(config.proxy_addr))
        .with_outbound(Handshake::http_connect(config.request))
        .with_guard(SocketGuard::for_vpn_mode(config.vpn_mode));

    serve(ListenerConfig::new(config.listen_addr.clone()), Arc::new(endpoint))
        .await
        .with_context(|| format!("Tunnel client failed on {}", config.listen_addr))?;

    info!("Tunnel client shutdown complete");
    Ok(())
}
