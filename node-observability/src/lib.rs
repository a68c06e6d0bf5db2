//! Tracing subscriber setup, extracted out of the agent's entry point so it
//! can be unit-tested and reused the same way whether the agent is started
//! directly or embedded in an integration test harness.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides `level` when
/// set, otherwise `level` (expected to be one of the standard
/// `tracing`/`log` severities) becomes the default filter directive.
pub fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_falls_back_to_the_given_level_when_rust_log_is_unset() {
        std::env::remove_var("RUST_LOG");
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        assert_eq!(filter.to_string(), "debug");
    }
}
