//! Tracing initialization.
//!
//! `RUST_LOG` wins over the configured level, so an operator can turn on
//! `claimlog_core=debug` to watch contention without touching the config.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Install a fmt subscriber on stderr. Returns `false` if one was already set
/// (tests, embedding applications).
pub fn init_tracing(default_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init_tracing("debug");
        assert!(!init_tracing("info"));
    }
}
