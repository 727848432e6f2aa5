//! Tunnel client configuration (plugin environment).

use anyhow::{Context, Result};
use snigate_proxy::plugin::join_host_port;
use snigate_proxy::proxy::ConnectRequest;
use snigate_proxy::PluginEnv;

/// Tunnel client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where local applications connect (`SS_LOCAL_HOST:SS_LOCAL_PORT`).
    pub listen_addr: String,

    /// CONNECT proxy to dial (`host`:`port` options).
    pub proxy_addr: String,

    /// CONNECT target and credentials.
    pub request: ConnectRequest,

    /// Protect outbound sockets from the VPN tunnel.
    pub vpn_mode: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_plugin(PluginEnv::from_env()?)
    }

    /// Options: `host`, `port` (proxy), `remotehost`, `remoteport` (CONNECT
    /// target), `id`, `key` (credentials), `Mode` (VPN mode, default off).
    ///
    /// `remotehost` defaults to `SS_REMOTE_HOST` when that is a host name,
    /// `remoteport` to `SS_REMOTE_PORT`.
    pub fn from_plugin(env: PluginEnv) -> Result<Self> {
        let options = &env.options;

        let proxy_host = options.require("host")?;
        let proxy_port = options.port("port")?.context("Missing plugin option \"port\"")?;

        let remote_host = options
            .get("remotehost")
            .or_else(|| env.remote_host_name())
            .context(
                "Missing tunnel target. Set the `remotehost` plugin option when SS_REMOTE_HOST is an IP address.",
            )?;
        let remote_port = options.port("remoteport")?.unwrap_or(env.remote_port);

        let request = ConnectRequest::new(
            join_host_port(remote_host, remote_port),
            options.get("id").unwrap_or_default(),
            options.get("key").unwrap_or_default(),
        );

        Ok(Self {
            listen_addr: env.local_addr(),
            proxy_addr: join_host_port(proxy_host, proxy_port),
            request,
            vpn_mode: options.flag("Mode").unwrap_or(false),
        })
    }
}
