//! Latchkey Core - Fenced distributed locks
//!
//! This crate provides:
//! - Lock store over pluggable atomic backends (in-memory, Redis)
//! - Lock sessions with exclusive and spin acquisition
//! - Lock manager facade for running work under a lock
//! - Settings loading

pub mod manager;
pub mod session;
pub mod settings;
pub mod store;

// Re-export commonly used types
pub use manager::{LockManager, LockRequest};
pub use session::{
    LockSession, SPIN_CEILING, SPIN_DEFAULT_INTERVAL, SessionParams, SessionState, SpinLimits,
    SpinSchedule,
};
pub use settings::LockSettings;
pub use store::{LockBackend, LockStore, MemoryBackend, StoreError};

#[cfg(feature = "redis")]
pub use store::RedisBackend;

// Re-export common types
pub use latchkey_common::{DEFAULT_FAILURE_MESSAGE, LockError, LockMode};
