//! TLS-aware TCP proxying.
//!
//! This module provides:
//! - ClientHello SNI extraction
//! - Ordered regex routing
//! - Outbound dialing with optional socket protection
//! - Plain, TLS and HTTP CONNECT handshakes
//! - A half-close aware duplex relay
//! - Per-connection sessions and the listener that runs them
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> [inbound handshake] -> SNI Inspector -> Router
//!                                                                           |
//!                    Relay <- [outbound handshake] <- Dial (+ Socket Guard) <-
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use snigate_proxy::proxy::{Endpoint, Listener, ListenerConfig, RouteSource, RoutingTable};
//!
//! let table = RoutingTable::from_pairs([(r"example\.com$", "10.0.0.2:443")])?;
//! let endpoint = Arc::new(Endpoint::new("gateway", RouteSource::Sni(table)));
//! let listener = Listener::bind(ListenerConfig::new("0.0.0.0:443"), endpoint).await?;
//! listener.run(shutdown_rx).await?;
//! ```

mod dial;
mod handshake;
mod listener;
mod protect;
mod relay;
mod router;
mod session;
pub(crate) mod sni;
mod tls;

pub use dial::{dial, DialError, DEFAULT_DIAL_TIMEOUT};
pub use handshake::{
    connect_tunnel, ConnectRequest, Handshake, HandshakeError, DEFAULT_HANDSHAKE_TIMEOUT,
    MAX_CONNECT_RESPONSE,
};
pub use listener::{
    serve, shutdown_signal, Listener, ListenerConfig, ListenerStats, DEFAULT_DRAIN_TIMEOUT,
};
pub use protect::{ProtectError, SocketGuard, DEFAULT_PROTECT_PATH, DEFAULT_PROTECT_TIMEOUT};
pub use relay::{
    relay, BoxedTransport, Direction, ReadShutdown, RelayConfig, RelayOutcome, Transport,
    DEFAULT_BUFFER_SIZE,
};
pub use router::{RoutingRule, RoutingTable};
pub use session::{
    Endpoint, RouteSource, Session, SessionError, SessionOutcome, SessionState,
};
pub use sni::{
    extract_sni, SniConfig, SniError, SniInspector, SniffError, DEFAULT_MAX_SNIFF_BYTES,
    DEFAULT_SNIFF_TIMEOUT,
};
pub use tls::{
    client_config, client_config_with_roots, load_certs, load_private_key, server_config,
    CertSource, ManagedCertResolver, TlsConfigError, DEFAULT_CERT_CACHE_DIR,
};
