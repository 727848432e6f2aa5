//! Test harness for proxy integration tests.
//!
//! Provides helpers to spawn plain, TLS and CONNECT-proxy backends, a fake
//! socket protector, and endpoint listeners in a test environment.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use snigate_proxy::proxy::client_config_with_roots;
use snigate_proxy::{Endpoint, Listener, ListenerConfig, ListenerStats};

/// Self-signed certificate for one server name.
#[allow(dead_code)]
pub struct TestCert {
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
    key_der: Vec<u8>,
}

#[allow(dead_code)]
impl TestCert {
    pub fn generate(server_name: &str) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()]).unwrap();
        Self {
            cert_der: cert.cert.der().clone(),
            cert_pem: cert.cert.pem(),
            key_pem: cert.key_pair.serialize_pem(),
            key_der: cert.key_pair.serialize_der(),
        }
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        roots
    }

    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::new(client_config_with_roots(self.roots()).unwrap())
    }

    /// Write `cert.pem` and `key.pem` into `dir`.
    pub fn write_pem(&self, dir: &Path) -> (PathBuf, PathBuf) {
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, &self.cert_pem).unwrap();
        std::fs::write(&key, &self.key_pem).unwrap();
        (cert, key)
    }
}

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Plain backend that records the first bytes of each connection and
/// answers with a fixed reply before closing.
#[allow(dead_code)]
pub struct ReplyBackend {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<Vec<u8>>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl ReplyBackend {
    pub async fn spawn(reply: &'static [u8]) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                let store = Arc::clone(&received_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 4096];
                                    let n = stream.read(&mut buf).await.unwrap_or(0);
                                    store.lock().await.push(buf[..n].to_vec());
                                    let _ = stream.write_all(reply).await;
                                    let _ = stream.shutdown().await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub async fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().await.clone()
    }
}

impl Drop for ReplyBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// TLS backend that answers the first application read with `marker`.
#[allow(dead_code)]
pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert: TestCert,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TlsBackend {
    pub async fn spawn(server_name: &str, marker: &'static [u8]) -> io::Result<Self> {
        init_crypto_provider();

        let cert = TestCert::generate(server_name);
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert_der.clone()], cert.key())
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                                        let mut buf = vec![0u8; 1024];
                                        if tls_stream.read(&mut buf).await.is_ok() {
                                            let _ = tls_stream.write_all(marker).await;
                                            let _ = tls_stream.shutdown().await;
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// HTTP CONNECT proxy that records the request head, answers with
/// `response`, then echoes.
#[allow(dead_code)]
pub struct ConnectProxy {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl ConnectProxy {
    pub async fn spawn(response: &'static str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let requests_clone = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                let store = Arc::clone(&requests_clone);
                                tokio::spawn(async move {
                                    let mut head = Vec::new();
                                    let mut byte = [0u8; 1];
                                    while !head.ends_with(b"\r\n\r\n") {
                                        match stream.read(&mut byte).await {
                                            Ok(1) => head.push(byte[0]),
                                            _ => return,
                                        }
                                    }
                                    store
                                        .lock()
                                        .await
                                        .push(String::from_utf8_lossy(&head).into_owned());
                                    if stream.write_all(response.as_bytes()).await.is_err() {
                                        return;
                                    }
                                    let (mut read, mut write) = stream.split();
                                    let _ = tokio::io::copy(&mut read, &mut write).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

impl Drop for ConnectProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Socket protector listening on a Unix socket in a temporary directory.
///
/// Acknowledges every descriptor it receives and counts them.
#[cfg(unix)]
#[allow(dead_code)]
pub struct FakeProtector {
    pub path: PathBuf,
    pub protected: Arc<AtomicU64>,
    _dir: tempfile::TempDir,
}

#[cfg(unix)]
#[allow(dead_code)]
impl FakeProtector {
    pub fn spawn() -> io::Result<Self> {
        use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
        use std::io::{IoSliceMut, Write};
        use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("protect_path");
        let listener = UnixListener::bind(&path)?;
        let protected = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&protected);

        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else { break };
                let mut data = [0u8; 1];
                let mut iov = [IoSliceMut::new(&mut data)];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
                let Ok(msg) = recvmsg::<()>(
                    conn.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::empty(),
                ) else {
                    continue;
                };

                let mut fds = Vec::new();
                if let Ok(cmsgs) = msg.cmsgs() {
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            fds.extend(received);
                        }
                    }
                }
                for fd in fds {
                    // Close our duplicate.
                    drop(unsafe { OwnedFd::from_raw_fd(fd) });
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                let _ = conn.write_all(&[1]);
            }
        });

        Ok(Self {
            path,
            protected,
            _dir: dir,
        })
    }

    pub fn protected_count(&self) -> u64 {
        self.protected.load(Ordering::Relaxed)
    }
}

/// A running endpoint listener, stopped on drop.
#[allow(dead_code)]
pub struct EndpointHandle {
    pub listen_addr: SocketAddr,
    pub stats: Arc<ListenerStats>,
    shutdown_tx: watch::Sender<bool>,
}

#[allow(dead_code)]
impl EndpointHandle {
    pub async fn spawn(endpoint: Endpoint) -> io::Result<Self> {
        let listener =
            Listener::bind(ListenerConfig::new("127.0.0.1:0"), Arc::new(endpoint)).await?;
        let listen_addr = listener.local_addr()?;
        let stats = listener.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = listener.run(shutdown_rx).await;
        });

        Ok(Self {
            listen_addr,
            stats,
            shutdown_tx,
        })
    }

    /// Wait until `read` returns `value`, polling the listener stats.
    pub async fn wait_for<F>(&self, read: F, value: u64)
    where
        F: Fn(&ListenerStats) -> &AtomicU64,
    {
        for _ in 0..200 {
            if read(&self.stats).load(Ordering::Relaxed) == value {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("listener stat never reached {value}");
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// TLS client connection through `addr`, validating against `cert`.
#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert: &TestCert,
) -> io::Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(cert.client_config());
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string()).map_err(io::Error::other)?;
    connector.connect(server_name, stream).await
}

/// Minimal TLS 1.2 style ClientHello record carrying `host` as SNI.
#[allow(dead_code)]
pub fn client_hello(host: &str) -> Vec<u8> {
    let name = host.as_bytes();
    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(0);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = vec![0x00, 0x00];
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend(sni);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x42; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend(extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend(body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend(handshake);
    record
}
