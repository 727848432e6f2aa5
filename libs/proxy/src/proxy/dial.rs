//! Outbound connection establishment.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use super::protect::{ProtectError, SocketGuard};

/// Default bound on connecting to one backend address.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DialError {
    #[error("resolve {target}: {source}")]
    Resolve { target: String, source: io::Error },

    #[error("{0} resolved to no addresses")]
    NoAddresses(String),

    #[error(transparent)]
    Protect(#[from] ProtectError),

    #[error("connect {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
}

/// Connect to `target` (`host:port`), protecting the socket before it
/// connects when the guard is enabled.
///
/// Resolved addresses are tried in order; the last connect error is
/// returned when none succeeds. A protection failure aborts immediately.
pub async fn dial(
    target: &str,
    guard: &SocketGuard,
    connect_timeout: Duration,
) -> Result<TcpStream, DialError> {
    let addrs: Vec<SocketAddr> = lookup_host(target)
        .await
        .map_err(|source| DialError::Resolve {
            target: target.to_string(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| DialError::Connect { addr, source })?;

        guard.protect(&socket).await?;

        match timeout(connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
                }
                return Ok(stream);
            }
            Ok(Err(source)) => {
                debug!(%addr, error = %source, "Connect failed");
                last_error = Some(DialError::Connect { addr, source });
            }
            Err(_) => {
                debug!(%addr, "Connect timed out");
                last_error = Some(DialError::Connect {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        }
    }

    Err(last_error.unwrap_or_else(|| DialError::NoAddresses(target.to_string())))
}
