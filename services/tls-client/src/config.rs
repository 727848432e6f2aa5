//! TLS client configuration (plugin environment).

use anyhow::{Context, Result};
use snigate_proxy::PluginEnv;

/// TLS client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where local applications connect (`SS_LOCAL_HOST:SS_LOCAL_PORT`).
    pub listen_addr: String,

    /// Remote TLS server (`SS_REMOTE_HOST:SS_REMOTE_PORT`).
    pub backend_addr: String,

    /// Name the server certificate is validated against.
    pub server_name: String,

    /// Protect outbound sockets from the VPN tunnel.
    pub vpn_mode: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_plugin(PluginEnv::from_env()?)
    }

    /// Options: `domain` (server name), `Mode` (VPN mode, default off).
    pub fn from_plugin(env: PluginEnv) -> Result<Self> {
        let server_name = env
            .options
            .get("domain")
            .or_else(|| env.remote_host_name())
            .map(str::to_string)
            .context(
                "Missing server name. Set the `domain` plugin option when SS_REMOTE_HOST is an IP address.",
            )?;

        Ok(Self {
            listen_addr: env.local_addr(),
            backend_addr: env.remote_addr(),
            server_name,
            vpn_mode: env.options.flag("Mode").unwrap_or(false),
        })
    }
}
