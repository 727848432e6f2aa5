//! Bidirectional byte relay with half-close propagation.
//!
//! Each direction copies until its source reports end-of-stream, then closes
//! the read side of the source and the write side of the destination. The
//! opposite direction keeps draining until it reaches its own end-of-stream,
//! so a peer that half-closes never loses in-flight data.
//!
//! Whether a transport can half-close is a capability of the [`Transport`],
//! not something inferred from its concrete type. A destination without the
//! capability is closed fully, which also ends the direction reading from it.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::debug;

/// Default copy buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// A byte stream the relay can drive.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {
    /// Whether shutting down the write side leaves the read side usable.
    fn supports_half_close(&self) -> bool {
        false
    }

    /// Handle that shuts down only the read side of the underlying socket.
    fn read_shutdown(&self) -> Option<ReadShutdown> {
        None
    }
}

/// Owned, type-erased transport, as produced by the handshake adapter.
pub type BoxedTransport = Box<dyn Transport>;

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn supports_half_close(&self) -> bool {
        (**self).supports_half_close()
    }

    fn read_shutdown(&self) -> Option<ReadShutdown> {
        (**self).read_shutdown()
    }
}

impl Transport for TcpStream {
    fn supports_half_close(&self) -> bool {
        true
    }

    fn read_shutdown(&self) -> Option<ReadShutdown> {
        ReadShutdown::for_socket(self)
    }
}

impl<IO: Transport> Transport for tokio_rustls::client::TlsStream<IO> {
    /// close_notify followed by a write shutdown of the inner stream.
    fn supports_half_close(&self) -> bool {
        self.get_ref().0.supports_half_close()
    }
}

impl<IO: Transport> Transport for tokio_rustls::server::TlsStream<IO> {
    fn supports_half_close(&self) -> bool {
        self.get_ref().0.supports_half_close()
    }
}

impl Transport for DuplexStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

/// Shuts down the read side of a socket.
///
/// Only handed out for the lifetime of the relay that owns the socket.
#[derive(Debug, Clone, Copy)]
pub struct ReadShutdown {
    #[cfg(unix)]
    fd: std::os::fd::RawFd,
}

impl ReadShutdown {
    #[cfg(unix)]
    fn for_socket<S: std::os::fd::AsRawFd>(socket: &S) -> Option<Self> {
        Some(Self {
            fd: socket.as_raw_fd(),
        })
    }

    #[cfg(not(unix))]
    fn for_socket<S>(_socket: &S) -> Option<Self> {
        None
    }

    #[cfg(unix)]
    fn shutdown(self) {
        use nix::sys::socket::{shutdown, Shutdown};

        // ENOTCONN once the peer has fully closed is expected.
        if let Err(e) = shutdown(self.fd, Shutdown::Read) {
            debug!(error = %e, "Read shutdown failed");
        }
    }

    #[cfg(not(unix))]
    fn shutdown(self) {}
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Copy buffer size per direction.
    pub buffer_size: usize,
    /// Abort a direction when its source is silent this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound to outbound.
    Upload,
    /// Outbound to inbound.
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// Result of a completed relay.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes copied inbound to outbound.
    pub upload: u64,
    /// Bytes copied outbound to inbound.
    pub download: u64,
    /// First error reported by either direction, by completion order.
    pub error: Option<io::Error>,
}

impl RelayOutcome {
    pub fn into_result(self) -> io::Result<(u64, u64)> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.upload, self.download)),
        }
    }
}

/// Capabilities and close signal of one side of the relay.
struct Side {
    half_close: bool,
    read_shutdown: Option<ReadShutdown>,
    /// Fired when this side was fully closed by the opposite direction.
    closed: Notify,
}

impl Side {
    fn of<T: Transport>(transport: &T) -> Self {
        Self {
            half_close: transport.supports_half_close(),
            read_shutdown: transport.read_shutdown(),
            closed: Notify::new(),
        }
    }
}

struct Leg {
    bytes: u64,
    result: io::Result<()>,
    finished_at: usize,
}

/// Relay bytes between `inbound` and `outbound` until both directions end.
///
/// Both directions always run to completion; an error in one never cancels
/// the other.
pub async fn relay<A, B>(inbound: A, outbound: B, config: &RelayConfig) -> RelayOutcome
where
    A: Transport,
    B: Transport,
{
    let inbound_side = Side::of(&inbound);
    let outbound_side = Side::of(&outbound);
    let finish_order = AtomicUsize::new(0);

    let (inbound_read, inbound_write) = tokio::io::split(inbound);
    let (outbound_read, outbound_write) = tokio::io::split(outbound);

    let upload = pump(
        Direction::Upload,
        inbound_read,
        outbound_write,
        &inbound_side,
        &outbound_side,
        config,
        &finish_order,
    );
    let download = pump(
        Direction::Download,
        outbound_read,
        inbound_write,
        &outbound_side,
        &inbound_side,
        config,
        &finish_order,
    );

    let (upload, download) = tokio::join!(upload, download);

    let error = match (upload.result, download.result) {
        (Err(up), Err(down)) => Some(if upload.finished_at < download.finished_at {
            up
        } else {
            down
        }),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Some(e),
        (Ok(()), Ok(())) => None,
    };

    RelayOutcome {
        upload: upload.bytes,
        download: download.bytes,
        error,
    }
}

async fn pump<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    source: &Side,
    dest: &Side,
    config: &RelayConfig,
    finish_order: &AtomicUsize,
) -> Leg
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let mut buf = vec![0u8; config.buffer_size.max(1)];

    let result = loop {
        let read = tokio::select! {
            read = read_with_idle(&mut reader, &mut buf, config.idle_timeout) => read,
            _ = source.closed.notified() => Ok(0),
        };

        match read {
            Ok(0) => break Ok(()),
            Ok(n) => {
                // TLS writers hold records until flushed.
                if let Err(e) = write_chunk(&mut writer, &buf[..n]).await {
                    break Err(e);
                }
                bytes += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    if let Some(handle) = source.read_shutdown {
        handle.shutdown();
    }
    if let Err(e) = writer.shutdown().await {
        debug!(direction = direction.as_str(), error = %e, "Write shutdown failed");
    }
    if !dest.half_close {
        // Destination is now fully closed: nothing more will be read from it.
        dest.closed.notify_one();
    }

    debug!(
        direction = direction.as_str(),
        bytes,
        error = ?result.as_ref().err(),
        "Relay direction finished"
    );

    Leg {
        bytes,
        result,
        finished_at: finish_order.fetch_add(1, Ordering::SeqCst),
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

async fn read_with_idle<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        },
        None => reader.read(buf).await,
    }
}
