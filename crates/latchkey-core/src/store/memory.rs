// In-process lock backend
// Set-if-absent and compare-and-delete over a DashMap with per-record expiry

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{LockBackend, StoreError};

/// A live lock record
#[derive(Debug, Clone)]
struct LockRecord {
    secret: String,
    expires_at: Instant,
}

impl LockRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory lock backend
///
/// Every operation runs under the DashMap shard lock for its key, so the
/// existence check and the write are one atomic step. Expired records are
/// treated as absent on access; the optional sweeper only reclaims memory.
#[derive(Default)]
pub struct MemoryBackend {
    records: Arc<DashMap<String, LockRecord>>,
    sweeper: Option<JoinHandle<()>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend and start a background task evicting expired records
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_sweeper(interval: Duration) -> Self {
        let records: Arc<DashMap<String, LockRecord>> = Arc::new(DashMap::new());

        let records_clone = records.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = Self::evict_expired(&records_clone);
                if evicted > 0 {
                    debug!(count = evicted, "Cleaned up expired lock records");
                }
            }
        });

        info!(
            interval_ms = interval.as_millis() as u64,
            "MemoryBackend initialized with background sweeper"
        );

        Self {
            records,
            sweeper: Some(sweeper),
        }
    }

    fn evict_expired(records: &DashMap<String, LockRecord>) -> usize {
        let now = Instant::now();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(records.len())
    }

    /// Current live secret for `key`, if any
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.secret.clone())
    }

    /// Remaining time before `key` expires
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.expires_at - now)
    }

    /// Number of live records
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.records
            .iter()
            .filter(|record| !record.is_expired(now))
            .count()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if ttl.is_zero() {
            return Err(StoreError::Rejected("ttl must be positive".to_string()));
        }

        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| StoreError::Rejected(format!("ttl {:?} is too large", ttl)))?;
        let record = LockRecord {
            secret: value.to_string(),
            expires_at,
        };

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    entry.insert(record);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = self
            .records
            .remove_if(key, |_, record| {
                !record.is_expired(now) && record.secret == value
            })
            .is_some();

        if !removed {
            // Lazily drop an expired record left behind by a crashed holder
            self.records.remove_if(key, |_, record| record.is_expired(now));
        }

        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);

        assert!(backend.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!backend.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(backend.holder("k"), Some("a".to_string()));
        assert_eq!(backend.live_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let backend = MemoryBackend::new();
        let result = backend.set_if_absent("k", "a", Duration::ZERO).await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(backend.holder("k"), None);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_rejected() {
        let backend = MemoryBackend::new();
        let result = backend.set_if_absent("k", "a", Duration::MAX).await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(backend.holder("k"), None);
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_matching_value() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);

        backend.set_if_absent("k", "a", ttl).await.unwrap();
        assert!(!backend.compare_and_delete("k", "b").await.unwrap());
        assert_eq!(backend.holder("k"), Some("a".to_string()));
        assert!(backend.compare_and_delete("k", "a").await.unwrap());
        assert_eq!(backend.holder("k"), None);
        assert!(!backend.compare_and_delete("missing", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_is_absent() {
        let backend = MemoryBackend::new();

        backend
            .set_if_absent("k", "a", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(backend.remaining_ttl("k").is_some());

        tokio::time::advance(Duration::from_millis(150)).await;

        assert_eq!(backend.holder("k"), None);
        // The stale owner cannot release after expiry
        assert!(!backend.compare_and_delete("k", "a").await.unwrap());
        // A new contender takes over
        assert!(
            backend
                .set_if_absent("k", "b", Duration::from_secs(1))
                .await
                .unwrap()
        );
        assert_eq!(backend.holder("k"), Some("b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_expired_records() {
        let backend = MemoryBackend::with_sweeper(Duration::from_millis(50));

        backend
            .set_if_absent("short", "a", Duration::from_millis(10))
            .await
            .unwrap();
        backend
            .set_if_absent("long", "b", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(backend.records.len(), 1);
        assert_eq!(backend.holder("long"), Some("b".to_string()));
    }
}
