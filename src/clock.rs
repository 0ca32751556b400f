use std::time::Duration;

use chrono::{DateTime, Utc};

/// Monotonic "now" and cancellable sleeps, injectable so the Scheduler's
/// backoff math and expiry sweeps are testable without wall-clock waits.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, d: Duration);
}

/// The real clock: wall time plus `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A fixed/advanceable clock for tests. `sleep` advances the clock
    /// immediately rather than waiting, so tests run fast.
    pub struct FixedClock {
        millis: AtomicI64,
    }

    impl FixedClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                millis: AtomicI64::new(start.timestamp_millis()),
            }
        }

        pub fn advance(&self, d: Duration) {
            self.millis
                .fetch_add(d.as_millis() as i64, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
                .expect("valid timestamp")
        }

        async fn sleep(&self, d: Duration) {
            self.advance(d);
        }
    }
}
