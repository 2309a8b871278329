//! Lock manager facade
//!
//! Builds validated [`LockSession`]s and offers the run-under-lock entry
//! points used directly by callers or by key-resolving wrappers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use latchkey_common::{LockError, LockMode};
use serde::{Deserialize, Serialize};

use crate::session::{LockSession, SessionParams};
use crate::settings::LockSettings;
use crate::store::{LockBackend, LockStore, MemoryBackend};

/// A fully resolved lock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub key: String,
    pub ttl: Duration,
    #[serde(default)]
    pub mode: LockMode,
    #[serde(default)]
    pub retry_interval: Option<Duration>,
    #[serde(default)]
    pub max_retry_window: Option<Duration>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl LockRequest {
    pub fn exclusive(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            mode: LockMode::Exclusive,
            retry_interval: None,
            max_retry_window: None,
            failure_message: None,
        }
    }

    pub fn spin(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            mode: LockMode::Spin,
            ..Self::exclusive(key, ttl)
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn with_max_retry_window(mut self, window: Duration) -> Self {
        self.max_retry_window = Some(window);
        self
    }

    pub fn with_failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }
}

/// Entry point for building lock sessions over one store
#[derive(Debug, Clone)]
pub struct LockManager {
    store: LockStore,
    settings: Arc<LockSettings>,
}

impl LockManager {
    pub fn new(store: LockStore) -> Self {
        Self::with_settings(store, LockSettings::default())
    }

    pub fn with_settings(store: LockStore, settings: LockSettings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
        }
    }

    /// Manager over the given backend
    pub fn from_backend(backend: Arc<dyn LockBackend>, settings: LockSettings) -> Self {
        Self::with_settings(LockStore::new(backend), settings)
    }

    /// Manager over an in-process backend swept at the configured interval
    ///
    /// Must be called from within a tokio runtime.
    pub fn in_memory(settings: LockSettings) -> Self {
        let backend = MemoryBackend::with_sweeper(settings.sweep_interval);
        Self::from_backend(Arc::new(backend), settings)
    }

    /// The underlying store, for callers managing key/secret pairs themselves
    pub fn store(&self) -> &LockStore {
        &self.store
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Exclusive request for `key` with the configured default ttl
    pub fn request(&self, key: impl Into<String>) -> LockRequest {
        LockRequest::exclusive(key, self.settings.default_ttl)
    }

    /// Build a session; nothing touches the store yet.
    pub fn build_session(
        &self,
        key: &str,
        ttl: Duration,
        mode: LockMode,
        failure_message: Option<&str>,
        retry_interval: Option<Duration>,
        max_retry_window: Option<Duration>,
    ) -> Result<LockSession, LockError> {
        let failure_message = failure_message
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.failure_message.clone());

        LockSession::new(
            self.store.clone(),
            SessionParams {
                key: key.to_string(),
                ttl,
                mode,
                failure_message,
                retry_interval,
                max_retry_window,
                limits: self.settings.spin_limits(),
            },
        )
    }

    /// Build a session from a resolved request
    pub fn session(&self, request: &LockRequest) -> Result<LockSession, LockError> {
        self.build_session(
            &request.key,
            request.ttl,
            request.mode,
            request.failure_message.as_deref(),
            request.retry_interval,
            request.max_retry_window,
        )
    }

    /// Attempt an exclusive lock once and hand back the session.
    ///
    /// Check [`LockSession::is_held`]; the caller owns the release.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<LockSession, LockError> {
        self.try_acquire_request(&LockRequest::exclusive(key, ttl))
            .await
    }

    /// Attempt a spin lock once and hand back the session.
    ///
    /// A later [`LockSession::execute`] spins if the first attempt missed.
    pub async fn try_acquire_spin(
        &self,
        key: &str,
        ttl: Duration,
        retry_interval: Option<Duration>,
        max_retry_window: Option<Duration>,
    ) -> Result<LockSession, LockError> {
        let request = LockRequest {
            retry_interval,
            max_retry_window,
            ..LockRequest::spin(key, ttl)
        };
        self.try_acquire_request(&request).await
    }

    /// Attempt the lock described by `request` once and hand back the session.
    ///
    /// Unlike [`try_acquire`](Self::try_acquire) this carries the request's
    /// failure message into a later `LockTimeout`.
    pub async fn try_acquire_request(
        &self,
        request: &LockRequest,
    ) -> Result<LockSession, LockError> {
        let mut session = self.session(request)?;
        session.try_acquire_once().await;
        Ok(session)
    }

    /// Run `work` while holding the lock described by `request`.
    pub async fn run_under_lock<F, Fut, T, E>(&self, request: &LockRequest, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let mut session = self.session(request)?;
        session.execute(work).await
    }

    /// Run `work` under an exclusive lock on `key`
    pub async fn run_exclusive<F, Fut, T, E>(
        &self,
        key: &str,
        ttl: Duration,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.run_under_lock(&LockRequest::exclusive(key, ttl), work)
            .await
    }

    /// Run `work` under a spin lock on `key`
    pub async fn run_spin<F, Fut, T, E>(
        &self,
        key: &str,
        ttl: Duration,
        retry_interval: Option<Duration>,
        max_retry_window: Option<Duration>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let request = LockRequest {
            retry_interval,
            max_retry_window,
            ..LockRequest::spin(key, ttl)
        };
        self.run_under_lock(&request, work).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::session::SessionState;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_build_session_validates() {
        let manager = LockManager::new(LockStore::memory());

        assert!(matches!(
            manager.build_session("", ms(1000), LockMode::Exclusive, None, None, None),
            Err(LockError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.build_session("k", Duration::ZERO, LockMode::Exclusive, None, None, None),
            Err(LockError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.build_session("k", ms(1000), LockMode::Spin, None, Some(Duration::ZERO), None),
            Err(LockError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.build_session("k", ms(1000), LockMode::Spin, None, None, Some(Duration::ZERO)),
            Err(LockError::InvalidArgument(_))
        ));
        // Retry parameters are ignored for exclusive sessions
        assert!(
            manager
                .build_session("k", ms(1000), LockMode::Exclusive, None, Some(Duration::ZERO), None)
                .is_ok()
        );
    }

    #[test]
    fn test_build_session_applies_clamping() {
        let manager = LockManager::new(LockStore::memory());
        let session = manager
            .build_session("k", ms(3000), LockMode::Spin, None, Some(ms(4000)), Some(ms(3000)))
            .unwrap();

        assert_eq!(session.retry_interval(), Some(ms(1000)));
        assert_eq!(session.remaining_attempts(), 3);
    }

    #[test]
    fn test_failure_message_falls_back_to_settings() {
        let settings = LockSettings {
            failure_message: "try later".to_string(),
            ..Default::default()
        };
        let manager = LockManager::with_settings(LockStore::memory(), settings);

        let session = manager
            .build_session("k", ms(1000), LockMode::Exclusive, Some(" "), None, None)
            .unwrap();
        assert_eq!(session.failure_message(), "try later");

        let session = manager
            .build_session("k", ms(1000), LockMode::Exclusive, Some("busy"), None, None)
            .unwrap();
        assert_eq!(session.failure_message(), "busy");
    }

    #[test]
    fn test_request_uses_default_ttl() {
        let manager = LockManager::new(LockStore::memory());
        let request = manager.request("orders");
        assert_eq!(request.ttl, manager.settings().default_ttl);
        assert_eq!(request.mode, LockMode::Exclusive);

        let spin = LockRequest::spin("orders", ms(500))
            .with_retry_interval(ms(50))
            .with_max_retry_window(ms(400))
            .with_failure_message("busy");
        assert_eq!(spin.mode, LockMode::Spin);
        assert_eq!(spin.retry_interval, Some(ms(50)));
        assert_eq!(spin.max_retry_window, Some(ms(400)));
        assert_eq!(spin.failure_message.as_deref(), Some("busy"));
    }

    #[tokio::test]
    async fn test_try_acquire_returns_handle() {
        let manager = LockManager::new(LockStore::memory());

        let mut first = manager.try_acquire("report", ms(10_000)).await.unwrap();
        assert!(first.is_held());

        let second = manager.try_acquire("report", ms(10_000)).await.unwrap();
        assert!(!second.is_held());
        assert_eq!(second.state(), SessionState::Unheld);

        assert!(first.release().await);
        assert!(!first.is_held());

        let mut third = manager.try_acquire("report", ms(10_000)).await.unwrap();
        assert!(third.is_held());
        assert!(third.release().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_spin_then_execute() {
        let manager = LockManager::new(LockStore::memory());
        assert!(manager.store().acquire("report", "other", ms(150)).await);

        let mut session = manager
            .try_acquire_spin("report", ms(3000), Some(ms(100)), Some(ms(1000)))
            .await
            .unwrap();
        assert!(!session.is_held());

        let result: Result<u8, LockError> = session.execute(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(session.attempts_used(), 2);
    }

    #[tokio::test]
    async fn test_try_acquire_request_keeps_failure_message() {
        let manager = LockManager::new(LockStore::memory());
        assert!(manager.store().acquire("invoice", "other", ms(60_000)).await);

        let request =
            LockRequest::exclusive("invoice", ms(2000)).with_failure_message("invoice is locked");
        let mut session = manager.try_acquire_request(&request).await.unwrap();
        assert!(!session.is_held());
        assert_eq!(session.failure_message(), "invoice is locked");

        let result: Result<(), LockError> = session.execute(|| async { Ok(()) }).await;
        match result {
            Err(LockError::LockTimeout { message, .. }) => assert_eq!(message, "invoice is locked"),
            other => panic!("expected lock timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_try_acquire_rejects_unrepresentable_ttl() {
        let manager = LockManager::new(LockStore::memory());
        assert!(matches!(
            manager.try_acquire("k", Duration::MAX).await,
            Err(LockError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager
                .try_acquire_spin("k", Duration::MAX, None, None)
                .await,
            Err(LockError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_run_exclusive_and_run_spin() {
        let manager = LockManager::new(LockStore::memory());

        let a: Result<&str, LockError> = manager
            .run_exclusive("k", ms(1000), || async { Ok("a") })
            .await;
        assert_eq!(a.unwrap(), "a");

        let b: Result<&str, LockError> = manager
            .run_spin("k", ms(1000), Some(ms(10)), Some(ms(100)), || async { Ok("b") })
            .await;
        assert_eq!(b.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_run_under_lock_invalid_request_skips_work() {
        let manager = LockManager::new(LockStore::memory());
        let request = LockRequest::exclusive("", ms(1000));
        let ran = &AtomicBool::new(false);

        let result: Result<(), LockError> = manager
            .run_under_lock(&request, || async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(LockError::InvalidArgument(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_in_memory_manager() {
        let manager = LockManager::in_memory(LockSettings::default());
        assert_eq!(manager.store().backend_name(), "memory");

        let result: Result<u32, LockError> = manager
            .run_under_lock(&manager.request("k"), || async { Ok(1) })
            .await;
        assert_eq!(result.unwrap(), 1);
    }
}
