//! Socket protection for deployments embedded in a VPN service.
//!
//! Outbound sockets are handed to a privileged protector process before they
//! connect, so that their traffic bypasses the tunnel the proxy itself
//! serves. The request is the descriptor sent as `SCM_RIGHTS` ancillary data
//! over a Unix stream socket; the response is a single acknowledgement byte.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpSocket;
use tracing::{debug, warn};

/// Control socket path, relative to the working directory.
pub const DEFAULT_PROTECT_PATH: &str = "protect_path";

/// Bound on each step of the protection exchange.
pub const DEFAULT_PROTECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProtectError {
    #[error("connect to protector at {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error("send descriptor: {0}")]
    Send(#[source] io::Error),

    #[error("read acknowledgement: {0}")]
    Ack(#[source] io::Error),

    #[error("protector closed without acknowledging")]
    NoAck,

    #[error("protector timed out during {0}")]
    Timeout(&'static str),

    #[error("socket protection requires Unix-domain sockets")]
    Unsupported,
}

/// Decides whether outbound sockets are protected, and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SocketGuard {
    /// No protection; every call succeeds immediately.
    #[default]
    Disabled,
    /// Protect through the Unix-domain control socket at `path`.
    /// Fails with [`ProtectError::Unsupported`] on non-Unix platforms.
    Unix { path: PathBuf, timeout: Duration },
}

impl SocketGuard {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        SocketGuard::Unix {
            path: path.into(),
            timeout: DEFAULT_PROTECT_TIMEOUT,
        }
    }

    /// Guard for VPN mode at the default control path, or a disabled guard.
    pub fn for_vpn_mode(enabled: bool) -> Self {
        if enabled {
            Self::unix(DEFAULT_PROTECT_PATH)
        } else {
            SocketGuard::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, SocketGuard::Disabled)
    }

    /// Register `socket` with the protector and wait for its
    /// acknowledgement.
    ///
    /// The caller keeps ownership of the socket; the protector receives a
    /// duplicate descriptor for it.
    pub async fn protect(&self, socket: &TcpSocket) -> Result<(), ProtectError> {
        match self {
            SocketGuard::Disabled => Ok(()),
            SocketGuard::Unix { path, timeout } => {
                let result = unix::protect(path, socket, *timeout).await;
                match &result {
                    Ok(()) => debug!(path = %path.display(), "Socket protected"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Socket protection failed"),
                }
                result
            }
        }
    }
}

#[cfg(unix)]
mod unix {
    use std::io::{self, IoSlice};
    use std::os::fd::{AsRawFd, RawFd};
    use std::path::Path;
    use std::time::Duration;

    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
    use tokio::io::{AsyncReadExt, Interest};
    use tokio::net::{TcpSocket, UnixStream};
    use tokio::time::timeout;

    use super::ProtectError;

    pub(super) async fn protect(
        path: &Path,
        socket: &TcpSocket,
        limit: Duration,
    ) -> Result<(), ProtectError> {
        let mut channel = timeout(limit, UnixStream::connect(path))
            .await
            .map_err(|_| ProtectError::Timeout("connect"))?
            .map_err(|source| ProtectError::Connect {
                path: path.to_path_buf(),
                source,
            })?;

        timeout(limit, send_fd(&channel, socket.as_raw_fd()))
            .await
            .map_err(|_| ProtectError::Timeout("send"))?
            .map_err(ProtectError::Send)?;

        let mut ack = [0u8; 1];
        let n = timeout(limit, channel.read(&mut ack))
            .await
            .map_err(|_| ProtectError::Timeout("acknowledgement"))?
            .map_err(ProtectError::Ack)?;
        if n == 0 {
            return Err(ProtectError::NoAck);
        }
        Ok(())
    }

    async fn send_fd(channel: &UnixStream, fd: RawFd) -> io::Result<()> {
        let payload = [IoSlice::new(b"!")];
        let fds = [fd];

        loop {
            channel.writable().await?;
            let sent = channel.try_io(Interest::WRITABLE, || {
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(
                    channel.as_raw_fd(),
                    &payload,
                    &cmsgs,
                    MsgFlags::MSG_DONTWAIT,
                    None,
                )
                .map_err(io::Error::from)
            });

            match sent {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(not(unix))]
mod unix {
    use std::path::Path;
    use std::time::Duration;

    use tokio::net::TcpSocket;

    use super::ProtectError;

    pub(super) async fn protect(
        _path: &Path,
        _socket: &TcpSocket,
        _limit: Duration,
    ) -> Result<(), ProtectError> {
        Err(ProtectError::Unsupported)
    }
}
