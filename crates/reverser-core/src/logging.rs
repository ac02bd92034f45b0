//! Bootstraps `tracing-subscriber` from [`reverser_config::LoggingConfig`].
//!
//! Text output in development, JSON in anything that sets `logging.json`
//! (a log aggregator talking to a production cluster wants one object per
//! line, not a human-formatted line).

use reverser_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Safe to call once per process; a second
/// call is a no-op (`try_init` swallows the "already set" error) so tests
/// that spin up several components don't fight over the global default.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}
