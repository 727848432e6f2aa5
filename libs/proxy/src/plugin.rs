//! Plugin-style process configuration.
//!
//! Endpoint roles are launched with their addresses in `SS_LOCAL_HOST`,
//! `SS_LOCAL_PORT`, `SS_REMOTE_HOST` and `SS_REMOTE_PORT`, and role-specific
//! settings in `SS_PLUGIN_OPTIONS` as `key=value` pairs separated by `;`.

use std::net::IpAddr;

use thiserror::Error;

pub const SS_LOCAL_HOST: &str = "SS_LOCAL_HOST";
pub const SS_LOCAL_PORT: &str = "SS_LOCAL_PORT";
pub const SS_REMOTE_HOST: &str = "SS_REMOTE_HOST";
pub const SS_REMOTE_PORT: &str = "SS_REMOTE_PORT";
pub const SS_PLUGIN_OPTIONS: &str = "SS_PLUGIN_OPTIONS";

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("{name} must be a port number, got {value:?}")]
    InvalidPort { name: &'static str, value: String },

    #[error("missing plugin option {0:?}")]
    MissingOption(&'static str),

    #[error("plugin option {name:?} must be a port number, got {value:?}")]
    InvalidOptionPort { name: &'static str, value: String },
}

/// Parsed `SS_PLUGIN_OPTIONS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginOptions {
    pairs: Vec<(String, String)>,
}

impl PluginOptions {
    /// Parse `k1=v1;k2=v2`. Pairs without exactly one `=` are skipped.
    pub fn parse(raw: &str) -> Self {
        let pairs = raw
            .split(';')
            .filter_map(|pair| {
                let mut parts = pair.split('=');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(key), Some(value), None) => Some((key.to_string(), value.to_string())),
                    _ => None,
                }
            })
            .collect();
        Self { pairs }
    }

    /// Value of `key`; the last occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Boolean option: `false`, `False` and `0` are false, any other value
    /// is true. `None` when the option is absent.
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|value| !matches!(value, "false" | "False" | "0"))
    }

    pub fn require(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key).ok_or(ConfigError::MissingOption(key))
    }

    pub fn port(&self, key: &'static str) -> Result<Option<u16>, ConfigError> {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|_| ConfigError::InvalidOptionPort {
                    name: key,
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Addresses and options handed to an endpoint role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEnv {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub options: PluginOptions,
}

impl PluginEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));
        let port = |name: &'static str| {
            let value = required(name)?;
            value
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort { name, value })
        };

        Ok(Self {
            local_host: required(SS_LOCAL_HOST)?,
            local_port: port(SS_LOCAL_PORT)?,
            remote_host: required(SS_REMOTE_HOST)?,
            remote_port: port(SS_REMOTE_PORT)?,
            options: PluginOptions::parse(&lookup(SS_PLUGIN_OPTIONS).unwrap_or_default()),
        })
    }

    pub fn local_addr(&self) -> String {
        join_host_port(&self.local_host, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }

    /// `SS_REMOTE_HOST` when it is a host name rather than an IP literal.
    pub fn remote_host_name(&self) -> Option<&str> {
        host_name(&self.remote_host)
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// `host` unless it is empty or an IP literal.
pub fn host_name(host: &str) -> Option<&str> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.is_empty() || bare.parse::<IpAddr>().is_ok() {
        None
    } else {
        Some(host)
    }
}
