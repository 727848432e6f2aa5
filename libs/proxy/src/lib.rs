//! snigate proxy library.
//!
//! Building blocks shared by the gateway and the tunnel endpoint roles:
//! SNI routing, handshakes, socket protection, the duplex relay, and the
//! session and listener that tie them together.

pub mod logging;
pub mod plugin;
pub mod proxy;

pub use plugin::{ConfigError, PluginEnv, PluginOptions};
pub use proxy::{
    Endpoint, Handshake, Listener, ListenerConfig, ListenerStats, RouteSource, RoutingTable,
    Session, SessionOutcome, SessionState, SocketGuard,
};
