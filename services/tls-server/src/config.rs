//! TLS server configuration (plugin environment).

use std::path::PathBuf;

use anyhow::{bail, Result};
use snigate_proxy::proxy::CertSource;
use snigate_proxy::PluginEnv;

/// TLS server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Public TLS address (`SS_REMOTE_HOST:SS_REMOTE_PORT`).
    pub listen_addr: String,

    /// Plain backend (`SS_LOCAL_HOST:SS_LOCAL_PORT`).
    pub backend_addr: String,

    pub cert_source: CertSource,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_plugin(PluginEnv::from_env()?)
    }

    /// Options: `cert` and `key` for a static pair, otherwise `domain` for a
    /// managed certificate.
    pub fn from_plugin(env: PluginEnv) -> Result<Self> {
        let options = &env.options;
        let cert_source = match (options.get("cert"), options.get("domain")) {
            (Some(cert), _) => {
                let Some(key) = options.get("key") else {
                    bail!("The `cert` plugin option requires `key`.");
                };
                CertSource::Static {
                    cert: PathBuf::from(cert),
                    key: PathBuf::from(key),
                }
            }
            (None, Some(domain)) if !domain.is_empty() => CertSource::managed(domain),
            _ => bail!("Missing certificate. Set the `cert` and `key` plugin options, or `domain`."),
        };

        Ok(Self {
            listen_addr: env.remote_addr(),
            backend_addr: env.local_addr(),
            cert_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snigate_proxy::PluginOptions;

    fn env(options: &str) -> PluginEnv {
        PluginEnv {
            local_host: "127.0.0.1".to_string(),
            local_port: 8388,
            remote_host: "0.0.0.0".to_string(),
            remote_port: 443,
            options: PluginOptions::parse(options),
        }
    }

    #[test]
    fn test_static_certificate() {
        let config = Config::from_plugin(env("cert=/etc/tls/cert.pem;key=/etc/tls/key.pem")).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:443");
        assert_eq!(config.backend_addr, "127.0.0.1:8388");
        assert_eq!(
            config.cert_source,
            CertSource::Static {
                cert: PathBuf::from("/etc/tls/cert.pem"),
                key: PathBuf::from("/etc/tls/key.pem"),
            }
        );
    }

    #[test]
    fn test_managed_certificate() {
        let config = Config::from_plugin(env("domain=tls.example.com")).unwrap();
        assert_eq!(config.cert_source, CertSource::managed("tls.example.com"));
    }

    #[test]
    fn test_missing_certificate_settings() {
        assert!(Config::from_plugin(env("")).is_err());
        assert!(Config::from_plugin(env("domain=")).is_err());
        assert!(Config::from_plugin(env("cert=/etc/tls/cert.pem")).is_err());
    }
}
