//! snigate gateway
//!
//! Accepts TLS connections, reads the server name from the ClientHello and
//! forwards the untouched byte stream to the backend chosen by the first
//! matching routing rule. Connections without a route are closed silently.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use snigate_proxy::proxy::serve;
use snigate_proxy::{Endpoint, ListenerConfig, RouteSource};

mod config;

use config::{Args, GatewayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    snigate_proxy::logging::init();

    info!("Starting snigate gateway");

    let config = GatewayConfig::load(&args.conf)?;
    let listen_addr = config.listen_addr();
    let dial_timeout = config.dial_timeout();
    info!(
        conf = %args.conf.display(),
        listen_addr = %listen_addr,
        rule_count = config.rules.len(),
        dial_timeout_ms = config.dial_timeout_ms,
        "Configuration loaded"
    );

    let endpoint = Endpoint::new("gateway", RouteSource::Sni(config.rules))
        .with_dial_timeout(dial_timeout);

    serve(ListenerConfig::new(listen_addr.clone()), Arc::new(endpoint))
        .await
        .with_context(|| format!("Gateway failed on {listen_addr}"))?;

    info!("Gateway shutdown complete");
    Ok(())
}
