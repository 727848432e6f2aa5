//! Connection handshakes performed before the relay starts.
//!
//! A [`Handshake`] turns a freshly dialed or accepted stream into the
//! transport the relay runs over: unchanged, wrapped in TLS as a client or
//! server, or tunnelled through an HTTP CONNECT proxy.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::relay::{BoxedTransport, Transport};
use super::tls::{self, CertSource, TlsConfigError};

/// Default bound on a single handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest CONNECT response accepted from the tunnel proxy.
pub const MAX_CONNECT_RESPONSE: usize = 1000;

/// Acknowledgement the tunnel proxy must send.
const CONNECT_ESTABLISHED: &str = "Connection established";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("tls configuration: {0}")]
    Config(#[from] TlsConfigError),

    #[error("tls handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("tunnel rejected: {response:?}")]
    TunnelRejected { response: String },

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// CONNECT request sent to the tunnel proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// `host:port` the proxy should connect to.
    pub target: String,
    /// Value of the `Q-GUID` header.
    pub id: String,
    /// Value of the `Q-Token` header.
    pub key: String,
}

impl ConnectRequest {
    pub fn new(target: impl Into<String>, id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            id: id.into(),
            key: key.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\nQ-GUID: {id}\r\nQ-Token: {key}\r\n\r\n",
            target = self.target,
            id = self.id,
            key = self.key,
        )
    }
}

/// Send a CONNECT request and wait for the proxy's acknowledgement.
///
/// The header block is read a byte at a time. When the acknowledgement is
/// not in it, the body is read too: `Content-Length` bytes when declared,
/// otherwise whatever has already arrived. At most
/// [`MAX_CONNECT_RESPONSE`] bytes are consumed in total, and nothing after
/// the response belongs to it.
pub async fn connect_tunnel<S>(stream: &mut S, request: &ConnectRequest) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.encode().as_bytes()).await?;
    stream.flush().await?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while response.len() < MAX_CONNECT_RESPONSE {
        if stream.read(&mut byte).await? == 0 {
            break;
        }
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    if !contains_ack(&response) && response.ends_with(b"\r\n\r\n") {
        read_body(stream, &mut response).await?;
    }

    let response = String::from_utf8_lossy(&response);
    if response.contains(CONNECT_ESTABLISHED) {
        Ok(())
    } else {
        Err(HandshakeError::TunnelRejected {
            response: response.lines().next().unwrap_or_default().to_string(),
        })
    }
}

fn contains_ack(response: &[u8]) -> bool {
    response
        .windows(CONNECT_ESTABLISHED.len())
        .any(|w| w == CONNECT_ESTABLISHED.as_bytes())
}

/// Value of the `Content-Length` header in a response head.
fn content_length(head: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(head).lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

async fn read_body<S>(stream: &mut S, response: &mut Vec<u8>) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let remaining = MAX_CONNECT_RESPONSE.saturating_sub(response.len());
    if remaining == 0 {
        return Ok(());
    }

    match content_length(response) {
        Some(len) => {
            let limit = len.min(remaining) as u64;
            (&mut *stream).take(limit).read_to_end(response).await?;
        }
        None => {
            let mut body = vec![0u8; remaining];
            // Only bytes that are already readable.
            if let Ok(read) = tokio::time::timeout(Duration::ZERO, stream.read(&mut body)).await {
                let n = read?;
                response.extend_from_slice(&body[..n]);
            }
        }
    }
    Ok(())
}

/// Handshake variant applied to one side of a session.
#[derive(Clone)]
pub enum Handshake {
    /// Stream is used as-is.
    Plain,
    /// TLS client, validating the peer against `server_name`.
    TlsClient {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    /// TLS server.
    TlsServer { acceptor: TlsAcceptor },
    /// HTTP CONNECT tunnel through a proxy.
    HttpConnect(ConnectRequest),
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handshake::Plain => f.write_str("Plain"),
            Handshake::TlsClient { server_name, .. } => f
                .debug_struct("TlsClient")
                .field("server_name", server_name)
                .finish_non_exhaustive(),
            Handshake::TlsServer { .. } => f.debug_struct("TlsServer").finish_non_exhaustive(),
            Handshake::HttpConnect(request) => f
                .debug_struct("HttpConnect")
                .field("target", &request.target)
                .finish_non_exhaustive(),
        }
    }
}

impl Handshake {
    /// TLS client trusting the bundled web PKI roots.
    pub fn tls_client(server_name: &str) -> Result<Self, HandshakeError> {
        Self::tls_client_with_config(server_name, Arc::new(tls::client_config()?))
    }

    pub fn tls_client_with_config(
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<Self, HandshakeError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| HandshakeError::InvalidServerName(server_name.to_string()))?;
        Ok(Handshake::TlsClient {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    pub fn tls_server(source: &CertSource) -> Result<Self, HandshakeError> {
        Ok(Self::tls_server_with_config(Arc::new(tls::server_config(
            source,
        )?)))
    }

    pub fn tls_server_with_config(config: Arc<ServerConfig>) -> Self {
        Handshake::TlsServer {
            acceptor: TlsAcceptor::from(config),
        }
    }

    pub fn http_connect(request: ConnectRequest) -> Self {
        Handshake::HttpConnect(request)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Handshake::Plain => "plain",
            Handshake::TlsClient { .. } => "tls-client",
            Handshake::TlsServer { .. } => "tls-server",
            Handshake::HttpConnect(_) => "http-connect",
        }
    }

    pub fn is_plain(&self) -> bool {
        matches!(self, Handshake::Plain)
    }

    /// Run the handshake over `stream`.
    pub async fn perform<S>(&self, stream: S) -> Result<BoxedTransport, HandshakeError>
    where
        S: Transport + 'static,
    {
        match self {
            Handshake::Plain => Ok(Box::new(stream)),
            Handshake::TlsClient {
                connector,
                server_name,
            } => {
                let tls = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(HandshakeError::Tls)?;
                Ok(Box::new(tls))
            }
            Handshake::TlsServer { acceptor } => {
                let tls = acceptor.accept(stream).await.map_err(HandshakeError::Tls)?;
                Ok(Box::new(tls))
            }
            Handshake::HttpConnect(request) => {
                let mut stream = stream;
                connect_tunnel(&mut stream, request).await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// [`Handshake::perform`] bounded by `limit`.
    pub async fn perform_within<S>(
        &self,
        stream: S,
        limit: Duration,
    ) -> Result<BoxedTransport, HandshakeError>
    where
        S: Transport + 'static,
    {
        tokio::time::timeout(limit, self.perform(stream))
            .await
            .map_err(|_| HandshakeError::Timeout(limit))?
    }
}
