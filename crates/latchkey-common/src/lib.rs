//! Latchkey Common - Shared types and utilities
//!
//! This crate provides the foundational pieces used by the lock core:
//! - Error taxonomy (`LockError`)
//! - Snowflake id generation for fencing secrets
//! - Host identity helpers
//! - Logging bootstrap

pub mod error;
pub mod id;
pub mod logging;
pub mod utils;

use serde::{Deserialize, Serialize};

// Re-exports for convenience
pub use error::{DEFAULT_FAILURE_MESSAGE, LockError};
pub use id::{IdParts, UniqueIdGenerator, next_id, next_string_id};

/// How a lock session acquires its key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// A single acquisition attempt
    #[default]
    Exclusive,
    /// Bounded retries at a fixed interval
    Spin,
}

impl LockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Exclusive => "exclusive",
            LockMode::Spin => "spin",
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclusive" => Ok(LockMode::Exclusive),
            "spin" => Ok(LockMode::Spin),
            _ => Err(format!("Invalid lock mode: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode() {
        assert_eq!(LockMode::default(), LockMode::Exclusive);
        assert_eq!(LockMode::Spin.as_str(), "spin");
        assert_eq!("spin".parse::<LockMode>().unwrap(), LockMode::Spin);
        assert_eq!(
            "exclusive".parse::<LockMode>().unwrap(),
            LockMode::Exclusive
        );
        assert!("fifo".parse::<LockMode>().is_err());
    }
}
