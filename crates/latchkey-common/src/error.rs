//! Error types for Latchkey
//!
//! This module defines:
//! - `LockError`: the failure taxonomy surfaced by the locking machinery
//! - `DEFAULT_FAILURE_MESSAGE`: message used when the caller supplies none

use std::time::Duration;

use crate::LockMode;

/// Message carried by a `LockTimeout` when the caller did not provide one
pub const DEFAULT_FAILURE_MESSAGE: &str = "service busy, please try again later";

/// Locking failures
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Malformed construction parameters, detected before any store interaction
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The lock could not be obtained within policy
    #[error("{message} (key = {key}, ttl = {ttl:?}, mode = {mode})")]
    LockTimeout {
        key: String,
        ttl: Duration,
        mode: LockMode,
        retry_interval: Option<Duration>,
        max_retry_window: Option<Duration>,
        message: String,
    },

    /// The id generator observed time moving backward
    #[error("clock moved backwards, refusing to generate id for {} ms", regression_ms(.last_ms, .now_ms))]
    ClockRegression { last_ms: u64, now_ms: u64 },
}

fn regression_ms(last_ms: &u64, now_ms: &u64) -> u64 {
    last_ms.saturating_sub(*now_ms)
}

impl LockError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        LockError::InvalidArgument(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::LockTimeout { .. })
    }

    /// The lock key for errors raised on behalf of a specific lock
    pub fn key(&self) -> Option<&str> {
        match self {
            LockError::LockTimeout { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_carries_diagnostics() {
        let err = LockError::LockTimeout {
            key: "job-42".to_string(),
            ttl: Duration::from_millis(2000),
            mode: LockMode::Exclusive,
            retry_interval: None,
            max_retry_window: None,
            message: DEFAULT_FAILURE_MESSAGE.to_string(),
        };

        let text = err.to_string();
        assert!(text.starts_with(DEFAULT_FAILURE_MESSAGE));
        assert!(text.contains("job-42"));
        assert!(text.contains("exclusive"));
        assert!(err.is_timeout());
        assert_eq!(err.key(), Some("job-42"));
    }

    #[test]
    fn test_clock_regression_display() {
        let err = LockError::ClockRegression {
            last_ms: 1_000,
            now_ms: 990,
        };
        assert_eq!(
            err.to_string(),
            "clock moved backwards, refusing to generate id for 10 ms"
        );
        assert!(!err.is_timeout());
        assert_eq!(err.key(), None);
    }

    #[test]
    fn test_clock_regression_display_never_underflows() {
        let err = LockError::ClockRegression {
            last_ms: 990,
            now_ms: 1_000,
        };
        assert_eq!(
            err.to_string(),
            "clock moved backwards, refusing to generate id for 0 ms"
        );
    }

    #[test]
    fn test_invalid_argument() {
        let err = LockError::invalid_argument("ttl must be positive");
        assert_eq!(err.to_string(), "invalid argument: ttl must be positive");
    }
}
