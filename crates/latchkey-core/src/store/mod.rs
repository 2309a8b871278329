//! Lock store boundary
//!
//! `LockStore` is the only component that talks to the shared key-value
//! store. It wraps a [`LockBackend`], which supplies the two atomic
//! primitives, and folds every backend failure into the ordinary
//! "not acquired" / "not released" outcome after logging it.

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::{RELEASE_LOCK_SCRIPT, RedisBackend};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

/// Failure talking to the backing store
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected request: {0}")]
    Rejected(String),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Atomic primitives a backing store must provide
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Create `key = value` expiring after `ttl`, only if `key` is absent.
    ///
    /// Returns `true` iff this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Delete `key` only if its current value equals `value`, as one
    /// indivisible operation.
    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Short backend name used in log events
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Acquire/release over a backend, never surfacing store failures
#[derive(Clone)]
pub struct LockStore {
    backend: Arc<dyn LockBackend>,
}

impl LockStore {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Store over a fresh in-process backend
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Try to create the lock record `key = secret` with the given expiry.
    ///
    /// Returns `false` when the key is already held or the store call failed.
    pub async fn acquire(&self, key: &str, secret: &str, ttl: Duration) -> bool {
        match self.backend.set_if_absent(key, secret, ttl).await {
            Ok(true) => {
                metrics::counter!("latchkey_lock_acquire_total", "result" => "acquired")
                    .increment(1);
                debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
                true
            }
            Ok(false) => {
                metrics::counter!("latchkey_lock_acquire_total", "result" => "contended")
                    .increment(1);
                debug!(key = %key, "Lock held by another owner");
                false
            }
            Err(e) => {
                metrics::counter!("latchkey_lock_acquire_total", "result" => "error").increment(1);
                error!(
                    key = %key,
                    backend = self.backend.name(),
                    error = %e,
                    "Failed to acquire lock, treating as not acquired"
                );
                false
            }
        }
    }

    /// Delete the lock record if it still holds `secret`.
    ///
    /// Safe to call speculatively: returns `false` when the key expired,
    /// belongs to someone else, or the store call failed.
    pub async fn release(&self, key: &str, secret: &str) -> bool {
        match self.backend.compare_and_delete(key, secret).await {
            Ok(true) => {
                metrics::counter!("latchkey_lock_release_total", "result" => "released")
                    .increment(1);
                debug!(key = %key, "Lock released");
                true
            }
            Ok(false) => {
                metrics::counter!("latchkey_lock_release_total", "result" => "not_owner")
                    .increment(1);
                debug!(key = %key, "Lock not owned by this secret, nothing released");
                false
            }
            Err(e) => {
                metrics::counter!("latchkey_lock_release_total", "result" => "error").increment(1);
                error!(
                    key = %key,
                    backend = self.backend.name(),
                    error = %e,
                    "Failed to release lock"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for LockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}
