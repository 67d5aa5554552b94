//! Injectable time source and retry backoff

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Monotonic time source, injectable so tests can advance time deterministically
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic instant
    fn now(&self) -> Instant;

    /// Wall-clock time in UTC
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock for deterministic tests
pub struct ManualClock {
    base: Instant,
    epoch: DateTime<Utc>,
    offset: Mutex<Duration>,
    tick: Arc<Notify>,
}

impl ManualClock {
    pub fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            base: Instant::now(),
            epoch,
            offset: Mutex::new(Duration::ZERO),
            tick: Arc::new(Notify::new()),
        }
    }

    /// Advance the clock, waking every pending sleep whose deadline passed
    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.epoch + chrono::Duration::from_std(*self.offset.lock()).unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = *self.offset.lock() + duration;
        loop {
            let notified = self.tick.notified();
            if *self.offset.lock() >= deadline {
                return;
            }
            notified.await;
        }
    }
}

/// Exponential backoff with a cap: `delay(n) = min(base * 2^n, cap)`
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}
