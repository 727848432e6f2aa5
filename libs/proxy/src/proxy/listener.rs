//! TCP listener and session supervision.
//!
//! The listener accepts connections, runs one [`Session`] task per
//! connection and keeps counters over their outcomes. On shutdown it stops
//! accepting, gives in-flight sessions a grace period to finish, then
//! aborts the rest.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::session::{Endpoint, Session, SessionError, SessionOutcome};

/// Default grace period for in-flight sessions on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// `host:port` to bind to.
    pub bind_addr: String,
    /// Grace period for in-flight sessions on shutdown.
    pub drain_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions that relayed and closed.
    pub connections_closed: AtomicU64,
    /// Sessions dropped before relaying.
    pub connections_failed: AtomicU64,
    /// Connections that did not open with a usable ClientHello.
    pub sni_failed: AtomicU64,
    /// Server names that matched no rule.
    pub routes_failed: AtomicU64,
    /// Backend dials that failed, including protection failures.
    pub dial_failed: AtomicU64,
    /// Inbound or outbound handshakes that failed.
    pub handshake_failed: AtomicU64,
    /// Bytes relayed client to backend.
    pub bytes_upload: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_download: AtomicU64,
}

impl ListenerStats {
    fn record(&self, outcome: &SessionOutcome) {
        self.bytes_upload
            .fetch_add(outcome.upload, Ordering::Relaxed);
        self.bytes_download
            .fetch_add(outcome.download, Ordering::Relaxed);

        let Some(failure) = &outcome.failure else {
            self.connections_closed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.connections_failed.fetch_add(1, Ordering::Relaxed);
        let counter = match failure {
            SessionError::Sniff(_) => &self.sni_failed,
            SessionError::NoRoute { .. } => &self.routes_failed,
            SessionError::Dial { .. } => &self.dial_failed,
            SessionError::InboundHandshake(_) | SessionError::OutboundHandshake(_) => {
                &self.handshake_failed
            }
            SessionError::Replay(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts a session as active until dropped, including on panic or abort.
struct ActiveSession {
    stats: Arc<ListenerStats>,
}

impl ActiveSession {
    fn enter(stats: Arc<ListenerStats>) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A bound TCP listener serving one endpoint.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    endpoint: Arc<Endpoint>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, endpoint: Arc<Endpoint>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            role = %endpoint.role,
            "Listener bound"
        );

        Ok(Self {
            config,
            listener,
            endpoint,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` turns true or its sender is
    /// dropped, then drain.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let mut sessions = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        let active = ActiveSession::enter(Arc::clone(&self.stats));

                        let span = tracing::info_span!(
                            "session",
                            role = %self.endpoint.role,
                            peer = %peer
                        );
                        let session = Session::new(Arc::clone(&self.endpoint), stream, peer, span);
                        let stats = Arc::clone(&self.stats);
                        sessions.spawn(async move {
                            let _active = active;
                            let outcome = session.run().await;
                            stats.record(&outcome);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_join(joined);
                }
            }
        }

        drop(self.listener);
        info!(
            bind_addr = %local_addr,
            in_flight = sessions.len(),
            "Listener stopped accepting, draining sessions"
        );

        let drained =
            tokio::time::timeout(self.config.drain_timeout, drain(&mut sessions)).await;
        if drained.is_err() {
            warn!(
                remaining = sessions.len(),
                "Drain timeout reached, aborting sessions"
            );
            sessions.shutdown().await;
        }

        info!(bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }
}

async fn drain(sessions: &mut JoinSet<()>) {
    while let Some(joined) = sessions.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Session task panicked");
        }
    }
}

/// Bind and serve `endpoint` until Ctrl-C or SIGTERM, then drain.
pub async fn serve(config: ListenerConfig, endpoint: Arc<Endpoint>) -> io::Result<()> {
    let listener = Listener::bind(config, endpoint).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut run = tokio::spawn(listener.run(shutdown_rx));

    tokio::select! {
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
        }
        result = &mut run => return result.map_err(io::Error::other)?,
    }

    run.await.map_err(io::Error::other)?
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
