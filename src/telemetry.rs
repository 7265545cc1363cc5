//! Logging setup
//!
//! Installs a `tracing-subscriber` fmt layer filtered by `RUST_LOG`
//! (default `info`). Safe to call more than once; only the first call
//! installs anything.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber, returning whether this call installed it
pub fn init() -> bool {
    init_with(DEFAULT_FILTER)
}

/// Install the global subscriber with a fallback filter directive
pub fn init_with(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        assert!(!init());
    }
}
