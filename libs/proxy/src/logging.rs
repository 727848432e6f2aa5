//! Tracing initialization shared by every binary.
//!
//! The filter comes from `RUST_LOG`, falling back to `SNIGATE_LOG_LEVEL`
//! and then `info`. Output is JSON unless `SNIGATE_LOG_FORMAT=compact`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("compact") {
            LogFormat::Compact
        } else {
            LogFormat::Json
        }
    }

    pub fn from_env() -> Self {
        std::env::var("SNIGATE_LOG_FORMAT")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

/// Initialize the global subscriber from the environment.
pub fn init() {
    let level = std::env::var("SNIGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    init_with(&level, LogFormat::from_env());
}

/// Initialize the global subscriber with a fallback filter and format.
///
/// `RUST_LOG` still takes precedence over `fallback_filter`. Does nothing
/// when a global subscriber is already installed.
pub fn init_with(fallback_filter: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}
