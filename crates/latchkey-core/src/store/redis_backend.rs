//! Redis lock backend
//!
//! Acquire is a single `SET key value NX PX ttl`. Release runs a Lua script
//! so the compare and the delete happen inside the server as one step.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::info;

use super::{LockBackend, StoreError};

/// Deletes `KEYS[1]` only when it still holds `ARGV[1]`
pub const RELEASE_LOCK_SCRIPT: &str = "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Lock backend over a multiplexed Redis connection
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    release_script: redis::Script,
}

impl RedisBackend {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            release_script: redis::Script::new(RELEASE_LOCK_SCRIPT),
        }
    }

    /// Open a connection to the Redis server at `url` (e.g. `redis://127.0.0.1/`)
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %url, "Connected Redis lock backend");
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl LockBackend for RedisBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis())
            .map_err(|_| StoreError::Rejected(format!("ttl {:?} is too large", ttl)))?;
        if ttl_ms == 0 {
            return Err(StoreError::Rejected(
                "ttl must be at least one millisecond".to_string(),
            ));
        }

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted > 0)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_script_compares_before_delete() {
        let get = RELEASE_LOCK_SCRIPT.find("redis.call('get'").unwrap();
        let del = RELEASE_LOCK_SCRIPT.find("redis.call('del'").unwrap();
        assert!(get < del);
        assert!(RELEASE_LOCK_SCRIPT.contains("== ARGV[1]"));
    }

    // Requires a running server: LATCHKEY_REDIS_URL=redis://127.0.0.1/ cargo test --features redis -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_against_live_server() {
        let url = std::env::var("LATCHKEY_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let backend = RedisBackend::connect(&url).await.unwrap();
        let key = format!("latchkey:test:{}", latchkey_common::next_id().unwrap());
        let ttl = Duration::from_secs(5);

        assert!(backend.set_if_absent(&key, "a", ttl).await.unwrap());
        assert!(!backend.set_if_absent(&key, "b", ttl).await.unwrap());
        assert!(!backend.compare_and_delete(&key, "b").await.unwrap());
        assert!(backend.compare_and_delete(&key, "a").await.unwrap());
        assert!(!backend.compare_and_delete(&key, "a").await.unwrap());
    }
}
