//! Lock settings
//!
//! Loaded from an optional file plus `LATCHKEY_`-prefixed environment
//! variables, e.g. `LATCHKEY_LOCK__DEFAULT_TTL_MS=5000`.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment};
use latchkey_common::DEFAULT_FAILURE_MESSAGE;

use crate::session::{SPIN_CEILING, SPIN_DEFAULT_INTERVAL, SpinLimits};

pub const DEFAULT_TTL_MS_PROPERTY: &str = "lock.default_ttl_ms";
pub const SPIN_CEILING_MS_PROPERTY: &str = "lock.spin_ceiling_ms";
pub const SPIN_DEFAULT_INTERVAL_MS_PROPERTY: &str = "lock.spin_default_interval_ms";
pub const FAILURE_MESSAGE_PROPERTY: &str = "lock.failure_message";
pub const SWEEP_INTERVAL_MS_PROPERTY: &str = "lock.sweep_interval_ms";

/// Lock time-to-live when a request does not name one
pub const DEFAULT_TTL: Duration = Duration::from_millis(3000);

/// Sweep period of the in-memory backend
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Tunables shared by every session a manager builds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub default_ttl: Duration,
    pub spin_ceiling: Duration,
    pub spin_default_interval: Duration,
    pub failure_message: String,
    pub sweep_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            spin_ceiling: SPIN_CEILING,
            spin_default_interval: SPIN_DEFAULT_INTERVAL,
            failure_message: DEFAULT_FAILURE_MESSAGE.to_string(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl LockSettings {
    /// Load settings from `path` (if given) and the environment.
    ///
    /// Environment variables override file values.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("latchkey")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("failed to build lock settings")?;

        Ok(Self::from_config(&config))
    }

    /// Read settings from an already-built configuration.
    ///
    /// Missing, malformed or non-positive values keep their defaults.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();

        Self {
            default_ttl: millis(config, DEFAULT_TTL_MS_PROPERTY).unwrap_or(defaults.default_ttl),
            spin_ceiling: millis(config, SPIN_CEILING_MS_PROPERTY)
                .unwrap_or(defaults.spin_ceiling),
            spin_default_interval: millis(config, SPIN_DEFAULT_INTERVAL_MS_PROPERTY)
                .unwrap_or(defaults.spin_default_interval),
            failure_message: config
                .get_string(FAILURE_MESSAGE_PROPERTY)
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(defaults.failure_message),
            sweep_interval: millis(config, SWEEP_INTERVAL_MS_PROPERTY)
                .unwrap_or(defaults.sweep_interval),
        }
    }

    pub fn spin_limits(&self) -> SpinLimits {
        SpinLimits {
            ceiling: self.spin_ceiling,
            default_interval: self.spin_default_interval,
        }
    }
}

fn millis(config: &Config, key: &str) -> Option<Duration> {
    config
        .get_int(key)
        .ok()
        .filter(|v| *v > 0)
        .map(|v| Duration::from_millis(v as u64))
}
