//! Logging bootstrap for processes embedding Latchkey.
//!
//! The library itself only emits `tracing` events. Binaries and test
//! harnesses call [`init_logging`] once to install a console subscriber.
//! `RUST_LOG` takes precedence over the configured level when set.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Console logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is absent
    pub level: Level,
    /// Emit ANSI colors
    pub ansi: bool,
    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            ansi: true,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        let level = std::env::var("LATCHKEY_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);

        let ansi = std::env::var("LATCHKEY_LOG_ANSI")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);

        Self {
            level,
            ansi,
            with_target: true,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()))
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed (e.g. by another
/// test in the same process); the existing one is left untouched.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let layer = fmt::layer()
        .with_ansi(config.ansi)
        .with_target(config.with_target);

    Registry::default()
        .with(config.env_filter())
        .with(layer)
        .try_init()
        .is_ok()
}
