use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::db::Store;
use crate::error::StoreError;

/// The data half of the health endpoint. No HTTP server is wired up here;
/// this is the pure computation a route handler would serialize to JSON.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub active_subscriptions: i64,
    pub now: DateTime<Utc>,
}

impl HealthSnapshot {
    pub async fn compute(store: &Store, clock: &dyn Clock) -> Result<Self, StoreError> {
        let active_subscriptions = store.active_subscription_count().await?;
        Ok(Self {
            status: "ok",
            active_subscriptions,
            now: clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;

    #[tokio::test]
    async fn reports_ok_with_zero_subscriptions_on_a_fresh_store() {
        let store = Store::open_in_memory().await.unwrap();
        let clock = FixedClock::new(Utc::now());
        let snapshot = HealthSnapshot::compute(&store, &clock).await.unwrap();
        assert_eq!(snapshot.status, "ok");
        assert_eq!(snapshot.active_subscriptions, 0);
    }
}
