//! Lock session state machine
//!
//! A `LockSession` is one attempt to hold a named lock:
//!
//! ```text
//! Unheld --acquire ok--> Held --work + release--> Released
//!    |
//!    +--attempts exhausted / interrupted--> Failed
//! ```
//!
//! Exclusive sessions try the store once. Spin sessions retry every
//! `retry_interval` until `floor(max_retry_window / retry_interval)` extra
//! attempts are spent. Once held, the caller's work runs exactly once and the
//! lock is released before control returns, whatever the work's outcome.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use latchkey_common::{LockError, LockMode};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::LockStore;

/// Hard ceiling for a requested spin interval
pub const SPIN_CEILING: Duration = Duration::from_millis(3000);

/// Interval used when a request exceeds [`SPIN_CEILING`]
pub const SPIN_DEFAULT_INTERVAL: Duration = Duration::from_millis(300);

/// Bounds applied to caller-requested spin intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinLimits {
    pub ceiling: Duration,
    pub default_interval: Duration,
}

impl Default for SpinLimits {
    fn default() -> Self {
        Self {
            ceiling: SPIN_CEILING,
            default_interval: SPIN_DEFAULT_INTERVAL,
        }
    }
}

/// Effective retry parameters of a spin session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinSchedule {
    pub interval: Duration,
    pub max_window: Duration,
    /// Retries allowed after the first attempt
    pub attempts: u64,
}

impl SpinSchedule {
    /// Derive the schedule for a spin session.
    ///
    /// Precedence:
    /// 1. no interval, or one at or above `ttl`: `ttl / 3`
    /// 2. an interval above the ceiling: the default interval
    /// 3. otherwise the requested interval
    ///
    /// A result still at or above `ttl` (a default interval longer than a
    /// very short ttl) falls back to `ttl / 3`.
    pub fn derive(
        ttl: Duration,
        retry_interval: Option<Duration>,
        max_retry_window: Option<Duration>,
        limits: &SpinLimits,
    ) -> Result<Self, LockError> {
        if retry_interval.is_some_and(|d| d.is_zero()) {
            return Err(LockError::invalid_argument(
                "retry interval of a spin lock must be positive",
            ));
        }
        if max_retry_window.is_some_and(|d| d.is_zero()) {
            return Err(LockError::invalid_argument(
                "max retry window of a spin lock must be positive",
            ));
        }

        let mut interval = match retry_interval {
            None => ttl / 3,
            Some(requested) if requested >= ttl => ttl / 3,
            Some(requested) if requested > limits.ceiling => limits.default_interval,
            Some(requested) => requested,
        };
        if interval >= ttl {
            interval = ttl / 3;
        }
        if interval.is_zero() {
            return Err(LockError::invalid_argument(format!(
                "ttl {:?} is too short to derive a spin interval",
                ttl
            )));
        }

        let max_window = max_retry_window.unwrap_or(Duration::ZERO);
        let attempts =
            u64::try_from(max_window.as_nanos() / interval.as_nanos()).unwrap_or(u64::MAX);

        Ok(Self {
            interval,
            max_window,
            attempts,
        })
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unheld,
    Held,
    Released,
    Failed,
}

/// Validated construction parameters of a session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub key: String,
    pub ttl: Duration,
    pub mode: LockMode,
    pub failure_message: String,
    pub retry_interval: Option<Duration>,
    pub max_retry_window: Option<Duration>,
    pub limits: SpinLimits,
}

/// One attempt to hold a named lock
pub struct LockSession {
    key: String,
    secret: String,
    ttl: Duration,
    mode: LockMode,
    failure_message: String,
    schedule: Option<SpinSchedule>,
    remaining_attempts: u64,
    attempts_used: u64,
    state: SessionState,
    store: LockStore,
    interrupt: Option<broadcast::Receiver<()>>,
}

impl LockSession {
    /// Validate `params` and mint a fresh fencing secret.
    ///
    /// No store interaction happens here.
    pub fn new(store: LockStore, params: SessionParams) -> Result<Self, LockError> {
        if params.key.trim().is_empty() {
            return Err(LockError::invalid_argument("lock key cannot be empty"));
        }
        if params.ttl.is_zero() {
            return Err(LockError::invalid_argument("ttl of a lock must be positive"));
        }
        if u64::try_from(params.ttl.as_millis()).is_err()
            || Instant::now().checked_add(params.ttl).is_none()
        {
            return Err(LockError::invalid_argument(format!(
                "ttl {:?} of a lock is too large",
                params.ttl
            )));
        }

        let schedule = match params.mode {
            LockMode::Exclusive => None,
            LockMode::Spin => Some(SpinSchedule::derive(
                params.ttl,
                params.retry_interval,
                params.max_retry_window,
                &params.limits,
            )?),
        };
        let secret = latchkey_common::next_string_id()?;

        Ok(Self {
            key: params.key,
            secret,
            ttl: params.ttl,
            mode: params.mode,
            failure_message: params.failure_message,
            remaining_attempts: schedule.map(|s| s.attempts).unwrap_or(0),
            attempts_used: 0,
            schedule,
            state: SessionState::Unheld,
            store,
            interrupt: None,
        })
    }

    /// Stop spinning as soon as a message arrives on `signal`
    pub fn with_interrupt(mut self, signal: broadcast::Receiver<()>) -> Self {
        self.interrupt = Some(signal);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn failure_message(&self) -> &str {
        &self.failure_message
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state == SessionState::Held
    }

    pub fn schedule(&self) -> Option<&SpinSchedule> {
        self.schedule.as_ref()
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.schedule.map(|s| s.interval)
    }

    pub fn max_retry_window(&self) -> Option<Duration> {
        self.schedule.map(|s| s.max_window)
    }

    pub fn remaining_attempts(&self) -> u64 {
        self.remaining_attempts
    }

    pub fn attempts_used(&self) -> u64 {
        self.attempts_used
    }

    /// Make one acquisition attempt.
    ///
    /// Returns `true` without touching the store while already held.
    pub async fn try_acquire_once(&mut self) -> bool {
        if self.is_held() {
            return true;
        }

        if self.store.acquire(&self.key, &self.secret, self.ttl).await {
            self.state = SessionState::Held;
            true
        } else {
            false
        }
    }

    /// Release the lock if this session's secret still owns it.
    ///
    /// Safe to call at any time; returns `false` when nothing was released.
    pub async fn release(&mut self) -> bool {
        let released = self.store.release(&self.key, &self.secret).await;
        if self.is_held() {
            self.state = SessionState::Released;
        }
        released
    }

    /// Acquire according to the session mode, run `work`, then release.
    ///
    /// Errors from the work propagate after the release has been attempted.
    pub async fn execute<F, Fut, T, E>(&mut self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.execute_opt(Some(work)).await
    }

    /// Like [`execute`](Self::execute), for callers whose work may be absent.
    ///
    /// `None` fails with `InvalidArgument` before any store interaction.
    pub async fn execute_opt<F, Fut, T, E>(&mut self, work: Option<F>) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let Some(work) = work else {
            return Err(LockError::invalid_argument(format!(
                "work cannot execute because it is undefined, key = {}",
                self.key
            ))
            .into());
        };

        match self.mode {
            LockMode::Exclusive => self.run_exclusive(work).await,
            LockMode::Spin => self.run_spin(work).await,
        }
    }

    async fn run_exclusive<F, Fut, T, E>(&mut self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        if !self.try_acquire_once().await {
            debug!(key = %self.key, "Exclusive lock is held elsewhere");
            return Err(self.fail().into());
        }
        self.run_held(work).await
    }

    async fn run_spin<F, Fut, T, E>(&mut self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.spin_until_held().await?;
        self.run_held(work).await
    }

    async fn spin_until_held(&mut self) -> Result<(), LockError> {
        let interval = self.retry_interval().unwrap_or(SPIN_DEFAULT_INTERVAL);

        self.try_acquire_once().await;
        while !self.is_held() {
            if self.remaining_attempts == 0 {
                warn!(
                    key = %self.key,
                    attempts_used = self.attempts_used,
                    interval_ms = interval.as_millis() as u64,
                    "Spin lock retries exhausted"
                );
                return Err(self.fail());
            }

            if !self.pause(interval).await {
                warn!(
                    key = %self.key,
                    attempts_used = self.attempts_used,
                    interval_ms = interval.as_millis() as u64,
                    "Spin lock sleep interrupted, giving up"
                );
                return Err(self.fail());
            }

            self.remaining_attempts -= 1;
            self.attempts_used += 1;
            self.try_acquire_once().await;
        }
        Ok(())
    }

    /// Sleep for `interval`; returns `false` if interrupted
    async fn pause(&mut self, interval: Duration) -> bool {
        let deadline = Instant::now().checked_add(interval);
        let sleep = || match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline),
            None => tokio::time::sleep(interval),
        };

        if let Some(signal) = self.interrupt.as_mut() {
            let received = tokio::select! {
                _ = sleep() => return true,
                received = signal.recv() => received,
            };
            match received {
                Ok(()) | Err(RecvError::Lagged(_)) => return false,
                // Sender gone, no interrupt can arrive any more
                Err(RecvError::Closed) => self.interrupt = None,
            }
        }

        sleep().await;
        true
    }

    async fn run_held<F, Fut, T, E>(&mut self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let outcome = AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await;

        if !self.release().await {
            warn!(
                key = %self.key,
                ttl_ms = self.ttl.as_millis() as u64,
                "Lock was no longer owned at release, it may have expired during the work"
            );
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn fail(&mut self) -> LockError {
        self.state = SessionState::Failed;
        LockError::LockTimeout {
            key: self.key.clone(),
            ttl: self.ttl,
            mode: self.mode,
            retry_interval: self.retry_interval(),
            max_retry_window: self.max_retry_window(),
            message: self.failure_message.clone(),
        }
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        if !self.is_held() {
            return;
        }

        // Dropped while held (cancelled work, or a handle never released)
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let key = std::mem::take(&mut self.key);
                let secret = std::mem::take(&mut self.secret);
                handle.spawn(async move {
                    store.release(&key, &secret).await;
                });
            }
            Err(_) => {
                warn!(
                    key = %self.key,
                    ttl_ms = self.ttl.as_millis() as u64,
                    "Lock session dropped while held outside a runtime, lock lapses at ttl"
                );
            }
        }
    }
}

impl std::fmt::Debug for LockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSession")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("schedule", &self.schedule)
            .field("remaining_attempts", &self.remaining_attempts)
            .field("attempts_used", &self.attempts_used)
            .finish()
    }
}
