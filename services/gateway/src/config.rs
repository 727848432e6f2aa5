//! Gateway configuration.
//!
//! The rule file is a JSON document:
//!
//! ```json
//! {
//!   "ListenAddress": "0.0.0.0",
//!   "ListenPort": 443,
//!   "Rules": [
//!     {"pattern": "^a\\.example\\.com$", "target": "10.0.0.1:443"},
//!     {"example\\.com$": "10.0.0.2:443"}
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use snigate_proxy::plugin::join_host_port;
use snigate_proxy::proxy::DEFAULT_DIAL_TIMEOUT;
use snigate_proxy::RoutingTable;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "sni-gateway", version, about = "Route TLS connections by SNI")]
pub struct Args {
    /// Path to the JSON routing configuration.
    #[arg(long = "conf", env = "SNIGATE_CONF", default_value = "config.json")]
    pub conf: PathBuf,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT.as_millis() as u64
}

/// Gateway configuration file.
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(rename = "ListenAddress", default = "default_listen_address")]
    pub listen_address: String,

    #[serde(rename = "ListenPort")]
    pub listen_port: u16,

    /// Ordered routing rules; the first match wins.
    #[serde(rename = "Rules")]
    pub rules: RoutingTable,

    /// Backend connect timeout in milliseconds.
    #[serde(rename = "DialTimeoutMs", default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read routing config {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("Invalid routing config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        anyhow::ensure!(config.dial_timeout_ms > 0, "DialTimeoutMs must be positive");
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen_address, self.listen_port)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}
