//! Per-connection session: sniff, route, dial, handshake, relay.
//!
//! A session owns the accepted connection and, once dialed, the backend
//! connection. It walks the states below and always ends in `Closed` or
//! `Failed`:
//!
//! ```text
//! Accepted -> Sniffed -> Routed -> Dialed -> (Protected) -> Handshaken -> Relaying -> Closed
//!     \__________\_________\________\___________\______________\-----> Failed
//! ```
//!
//! Clients that cannot be routed see the connection close without a single
//! byte written to them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn, Instrument, Span};

use super::dial::{dial, DialError, DEFAULT_DIAL_TIMEOUT};
use super::handshake::{Handshake, HandshakeError, DEFAULT_HANDSHAKE_TIMEOUT};
use super::protect::SocketGuard;
use super::relay::{relay, RelayConfig, Transport};
use super::router::RoutingTable;
use super::sni::{SniConfig, SniInspector, SniffError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Sniffed,
    Routed,
    Dialed,
    Protected,
    Handshaken,
    Relaying,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Accepted => "accepted",
            SessionState::Sniffed => "sniffed",
            SessionState::Routed => "routed",
            SessionState::Dialed => "dialed",
            SessionState::Protected => "protected",
            SessionState::Handshaken => "handshaken",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// How a session picks its backend.
#[derive(Debug, Clone)]
pub enum RouteSource {
    /// Route on the ClientHello's server name.
    Sni(RoutingTable),
    /// Always dial this `host:port`.
    Fixed(String),
}

/// Immutable description of one serving endpoint, shared by its sessions.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Role name, used in logs.
    pub role: String,
    pub route: RouteSource,
    /// Handshake run on the accepted connection.
    pub inbound: Handshake,
    /// Handshake run on the dialed connection.
    pub outbound: Handshake,
    pub guard: SocketGuard,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub sni: SniConfig,
    pub relay: RelayConfig,
}

impl Endpoint {
    /// Plain on both sides, no protection, default timeouts.
    pub fn new(role: impl Into<String>, route: RouteSource) -> Self {
        Self {
            role: role.into(),
            route,
            inbound: Handshake::Plain,
            outbound: Handshake::Plain,
            guard: SocketGuard::Disabled,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            sni: SniConfig::default(),
            relay: RelayConfig::default(),
        }
    }

    pub fn with_inbound(mut self, handshake: Handshake) -> Self {
        self.inbound = handshake;
        self
    }

    pub fn with_outbound(mut self, handshake: Handshake) -> Self {
        self.outbound = handshake;
        self
    }

    pub fn with_guard(mut self, guard: SocketGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_sni_config(mut self, config: SniConfig) -> Self {
        self.sni = config;
        self
    }

    pub fn with_relay_config(mut self, config: RelayConfig) -> Self {
        self.relay = config;
        self
    }
}

/// Why a session failed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("inbound handshake: {0}")]
    InboundHandshake(#[source] HandshakeError),

    #[error("sniff: {0}")]
    Sniff(#[from] SniffError),

    #[error("no route for {server_name:?}")]
    NoRoute { server_name: String },

    #[error("dial {target}: {source}")]
    Dial { target: String, source: DialError },

    #[error("outbound handshake: {0}")]
    OutboundHandshake(#[source] HandshakeError),

    #[error("replay sniffed bytes: {0}")]
    Replay(#[source] io::Error),
}

/// Final report of a session.
#[derive(Debug)]
pub struct SessionOutcome {
    /// `Closed` or `Failed`.
    pub state: SessionState,
    /// Every state entered, in order, starting with `Accepted`.
    pub history: Vec<SessionState>,
    pub server_name: Option<String>,
    pub target: Option<String>,
    pub upload: u64,
    pub download: u64,
    /// Set when the session failed before relaying.
    pub failure: Option<SessionError>,
    /// First relay error. A closed session may still carry one.
    pub relay_error: Option<io::Error>,
}

impl SessionOutcome {
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

/// One accepted connection and its lifecycle.
pub struct Session<S> {
    endpoint: Arc<Endpoint>,
    inbound: S,
    peer: SocketAddr,
    span: Span,
}

impl<S: Transport + 'static> Session<S> {
    /// `span` receives every log line of the session; pass `Span::none()`
    /// to run silently.
    pub fn new(endpoint: Arc<Endpoint>, inbound: S, peer: SocketAddr, span: Span) -> Self {
        Self {
            endpoint,
            inbound,
            peer,
            span,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drive the session to a terminal state.
    pub async fn run(self) -> SessionOutcome {
        let span = self.span.clone();
        self.drive().instrument(span).await
    }

    async fn drive(self) -> SessionOutcome {
        let Session {
            endpoint,
            inbound,
            peer,
            ..
        } = self;

        let mut outcome = SessionOutcome {
            state: SessionState::Accepted,
            history: vec![SessionState::Accepted],
            server_name: None,
            target: None,
            upload: 0,
            download: 0,
            failure: None,
            relay_error: None,
        };
        debug!(peer = %peer, role = %endpoint.role, "Session accepted");

        if let Err(e) = establish_and_relay(&endpoint, inbound, &mut outcome).await {
            log_failure(&e, outcome.state);
            outcome.failure = Some(e);
            advance(&mut outcome, SessionState::Failed);
            return outcome;
        }

        advance(&mut outcome, SessionState::Closed);
        match &outcome.relay_error {
            Some(e) => debug!(
                upload = outcome.upload,
                download = outcome.download,
                error = %e,
                "Session closed after relay error"
            ),
            None => debug!(
                upload = outcome.upload,
                download = outcome.download,
                "Session closed"
            ),
        }
        outcome
    }
}

fn advance(outcome: &mut SessionOutcome, next: SessionState) {
    outcome.state = next;
    outcome.history.push(next);
}

async fn establish_and_relay<S: Transport + 'static>(
    endpoint: &Endpoint,
    inbound: S,
    outcome: &mut SessionOutcome,
) -> Result<(), SessionError> {
    let mut inbound = endpoint
        .inbound
        .perform_within(inbound, endpoint.handshake_timeout)
        .await
        .map_err(SessionError::InboundHandshake)?;

    let mut sniffed = Vec::new();
    let target = match &endpoint.route {
        RouteSource::Sni(table) => {
            let inspector = SniInspector::with_config(endpoint.sni.clone());
            let server_name = inspector.inspect(&mut inbound, &mut sniffed).await?;
            outcome.server_name = Some(server_name.clone());
            advance(outcome, SessionState::Sniffed);

            table
                .resolve(&server_name)
                .map(str::to_string)
                .ok_or(SessionError::NoRoute { server_name })?
        }
        RouteSource::Fixed(target) => {
            advance(outcome, SessionState::Sniffed);
            target.clone()
        }
    };
    outcome.target = Some(target.clone());
    advance(outcome, SessionState::Routed);

    let stream = dial(&target, &endpoint.guard, endpoint.dial_timeout)
        .await
        .map_err(|source| SessionError::Dial {
            target: target.clone(),
            source,
        })?;
    advance(outcome, SessionState::Dialed);
    if endpoint.guard.is_enabled() {
        // Protection ran on the socket before it connected.
        advance(outcome, SessionState::Protected);
    }

    let mut outbound = endpoint
        .outbound
        .perform_within(stream, endpoint.handshake_timeout)
        .await
        .map_err(SessionError::OutboundHandshake)?;
    advance(outcome, SessionState::Handshaken);

    if !sniffed.is_empty() {
        outbound
            .write_all(&sniffed)
            .await
            .map_err(SessionError::Replay)?;
    }

    info!(
        server_name = outcome.server_name.as_deref().unwrap_or(""),
        target = %target,
        "Relaying"
    );
    advance(outcome, SessionState::Relaying);

    let result = relay(inbound, outbound, &endpoint.relay).await;
    outcome.upload = result.upload;
    outcome.download = result.download;
    outcome.relay_error = result.error;
    Ok(())
}

fn log_failure(error: &SessionError, state: SessionState) {
    match error {
        SessionError::Sniff(_) | SessionError::NoRoute { .. } => {
            debug!(state = state.as_str(), error = %error, "Dropping connection");
        }
        SessionError::InboundHandshake(_)
        | SessionError::Dial { .. }
        | SessionError::OutboundHandshake(_) => {
            warn!(state = state.as_str(), error = %error, "Session failed");
        }
        SessionError::Replay(_) => {
            debug!(state = state.as_str(), error = %error, "Backend closed before relay");
        }
    }
}
