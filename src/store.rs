use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::Row;

use crate::db::Store;
use crate::error::StoreError;
use crate::model::{
    ActiveSubscription, CheckLog, DeliveryStatus, Notification, NotificationId, Rgb, Subscription,
    SubscriptionId, SubscriptionState, Target, TargetId, User, UserId,
};

impl Store {
    pub async fn upsert_user(
        &self,
        email: &str,
        credential_hash: &str,
    ) -> Result<UserId, StoreError> {
        if let Some(row) = sqlx::query("SELECT id, credential_hash FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
        {
            let existing_hash: String = row.try_get("credential_hash")?;
            if existing_hash != credential_hash {
                return Err(StoreError::Conflict);
            }
            return Ok(row.try_get("id")?);
        }

        let row = sqlx::query("INSERT INTO users (email, credential_hash) VALUES (?, ?) RETURNING id")
            .bind(email)
            .bind(credential_hash)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("id")?)
    }

    /// Forms the cross product of `target_ids` x `dates`, skipping exact
    /// duplicates (the unique `(user, target, date)` constraint) and
    /// dates already in the past in the owner's zone, silently.
    pub async fn create_subscriptions(
        &self,
        user_id: UserId,
        target_ids: &[TargetId],
        dates: &[NaiveDate],
        today_in_owner_zone: NaiveDate,
    ) -> Result<Vec<SubscriptionId>, StoreError> {
        let mut created = Vec::new();
        let mut tx = self.pool.begin().await?;

        for &target_id in target_ids {
            for &date in dates {
                if date < today_in_owner_zone {
                    continue;
                }

                let row = sqlx::query(
                    "INSERT INTO subscriptions (user_id, target_id, target_date)
                     VALUES (?, ?, ?)
                     ON CONFLICT(user_id, target_id, target_date) DO NOTHING
                     RETURNING id",
                )
                .bind(user_id)
                .bind(target_id)
                .bind(date)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(row) = row {
                    created.push(row.try_get("id")?);
                }
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    pub async fn list_active(&self) -> Result<Vec<ActiveSubscription>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.id, s.user_id, s.target_id, s.target_date, s.state, s.priority,
                    s.success_count, u.email, u.zone,
                    t.name, t.calendar_url, t.available_r, t.available_g, t.available_b,
                    t.check_cadence_hint_secs
             FROM subscriptions s
             JOIN users u ON u.id = s.user_id
             JOIN targets t ON t.id = s.target_id
             WHERE s.state = 'ACTIVE'
             ORDER BY s.priority DESC, s.created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let state_str: String = row.try_get("state")?;
            out.push(ActiveSubscription {
                subscription: Subscription {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    target_id: row.try_get("target_id")?,
                    target_date: row.try_get("target_date")?,
                    state: state_str.parse().map_err(|_| {
                        StoreError::Sqlx(sqlx::Error::Decode(
                            "unrecognized subscription state".into(),
                        ))
                    })?,
                    priority: row.try_get("priority")?,
                    success_count: row.try_get("success_count")?,
                },
                owner_email: row.try_get("email")?,
                owner_zone: row.try_get("zone")?,
                target: Target {
                    id: row.try_get("target_id")?,
                    name: row.try_get("name")?,
                    calendar_url: row.try_get("calendar_url")?,
                    available_rgb: Rgb(
                        row.try_get::<i64, _>("available_r")? as u8,
                        row.try_get::<i64, _>("available_g")? as u8,
                        row.try_get::<i64, _>("available_b")? as u8,
                    ),
                    check_cadence_hint_secs: row.try_get("check_cadence_hint_secs")?,
                },
            });
        }
        Ok(out)
    }

    /// Removes subscriptions whose date is before `now` in their owner's
    /// zone. Runs at the top of every tick; idempotent — running it twice
    /// in a row deletes nothing the second time.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let rows = sqlx::query(
            "SELECT s.id, s.target_date, u.zone FROM subscriptions s
             JOIN users u ON u.id = s.user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut expired_ids = Vec::new();
        for row in rows {
            let id: SubscriptionId = row.try_get("id")?;
            let target_date: NaiveDate = row.try_get("target_date")?;
            let zone_str: String = row.try_get("zone")?;
            let tz: Tz = zone_str.parse().unwrap_or(chrono_tz::UTC);
            let today = now.with_timezone(&tz).date_naive();
            if target_date < today {
                expired_ids.push(id);
            }
        }

        if expired_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut count = 0u64;
        for id in &expired_ids {
            let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            count += result.rows_affected();
        }
        tx.commit().await?;
        Ok(count)
    }

    pub async fn mark_state(
        &self,
        sub_id: SubscriptionId,
        state: SubscriptionState,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE subscriptions SET state = ? WHERE id = ?")
            .bind(state.to_string())
            .bind(sub_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_last_checked(
        &self,
        sub_id: SubscriptionId,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE subscriptions SET last_checked_at = ? WHERE id = ?")
            .bind(ts.to_rfc3339())
            .bind(sub_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_success_count(&self, sub_id: SubscriptionId) -> Result<(), StoreError> {
        sqlx::query("UPDATE subscriptions SET success_count = success_count + 1 WHERE id = ?")
            .bind(sub_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts the pre-send Notification row. The caller (Notifier) marks
    /// it delivered/failed afterward via `update_notification_status`.
    pub async fn record_notification(
        &self,
        user_id: UserId,
        subscription_id: SubscriptionId,
        target_name: &str,
        target_date: NaiveDate,
    ) -> Result<NotificationId, StoreError> {
        let row = sqlx::query(
            "INSERT INTO notifications (user_id, subscription_id, ts, delivery_status, target_name, target_date)
             VALUES (?, ?, ?, 'pending', ?, ?)
             RETURNING id",
        )
        .bind(user_id)
        .bind(subscription_id)
        .bind(Utc::now().to_rfc3339())
        .bind(target_name)
        .bind(target_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    pub async fn update_notification_status(
        &self,
        notification_id: NotificationId,
        status: DeliveryStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE notifications SET delivery_status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(notification_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Backs the soft debounce rule: true if a Notification for this
    /// subscription was recorded at or after `since`.
    pub async fn recent_notification_within(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as c FROM notifications
             WHERE subscription_id = ? AND ts >= ?",
        )
        .bind(subscription_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("c")?;
        Ok(count > 0)
    }

    pub async fn record_check(&self, log: &CheckLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO check_logs (target_id, ts, outcome, elapsed_ms, found_available, err_text)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(log.target_id)
        .bind(Utc::now().to_rfc3339())
        .bind(log.outcome.to_string())
        .bind(log.elapsed_ms)
        .bind(log.found_available)
        .bind(&log.err_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_subscription(
        &self,
        sub_id: SubscriptionId,
    ) -> Result<(Subscription, User, Target), StoreError> {
        let row = sqlx::query(
            "SELECT s.id, s.user_id, s.target_id, s.target_date, s.state, s.priority,
                    s.success_count,
                    u.email, u.credential_hash, u.display_name, u.zone,
                    t.name, t.calendar_url, t.available_r, t.available_g, t.available_b,
                    t.check_cadence_hint_secs
             FROM subscriptions s
             JOIN users u ON u.id = s.user_id
             JOIN targets t ON t.id = s.target_id
             WHERE s.id = ?",
        )
        .bind(sub_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        let state_str: String = row.try_get("state")?;
        let subscription = Subscription {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            target_id: row.try_get("target_id")?,
            target_date: row.try_get("target_date")?,
            state: state_str
                .parse()
                .map_err(|_| StoreError::Sqlx(sqlx::Error::Decode("bad state".into())))?,
            priority: row.try_get("priority")?,
            success_count: row.try_get("success_count")?,
        };
        let user = User {
            id: row.try_get("user_id")?,
            email: row.try_get("email")?,
            credential_hash: row.try_get("credential_hash")?,
            display_name: row.try_get("display_name")?,
            zone: row.try_get("zone")?,
        };
        let target = Target {
            id: row.try_get("target_id")?,
            name: row.try_get("name")?,
            calendar_url: row.try_get("calendar_url")?,
            available_rgb: Rgb(
                row.try_get::<i64, _>("available_r")? as u8,
                row.try_get::<i64, _>("available_g")? as u8,
                row.try_get::<i64, _>("available_b")? as u8,
            ),
            check_cadence_hint_secs: row.try_get("check_cadence_hint_secs")?,
        };

        Ok((subscription, user, target))
    }

    pub async fn delete_subscription(
        &self,
        sub_id: SubscriptionId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT user_id FROM subscriptions WHERE id = ?")
            .bind(sub_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;

        let owner: UserId = row.try_get("user_id")?;
        if owner != user_id {
            return Err(StoreError::Forbidden);
        }

        sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(sub_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_user_cascade(&self, user_id: UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_notifications_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, subscription_id, delivery_status, target_name, target_date
             FROM notifications WHERE user_id = ? ORDER BY ts DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status_str: String = row.try_get("delivery_status")?;
            out.push(Notification {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                subscription_id: row.try_get("subscription_id")?,
                delivery_status: if status_str == "sent" {
                    DeliveryStatus::Sent
                } else {
                    DeliveryStatus::Failed
                },
                target_name: row.try_get("target_name")?,
                target_date: row.try_get("target_date")?,
            });
        }
        Ok(out)
    }

    pub async fn active_subscription_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM subscriptions WHERE state = 'ACTIVE'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TargetSeed;

    async fn setup() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    async fn seed_one_target(store: &Store) -> TargetId {
        store
            .seed_targets(&[TargetSeed {
                name: "Test Resort",
                calendar_url: "https://example.test/calendar",
                available_rgb: Rgb(49, 200, 25),
                check_cadence_hint_secs: 120,
            }])
            .await
            .unwrap();
        let row = sqlx::query("SELECT id FROM targets WHERE name = 'Test Resort'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        row.try_get("id").unwrap()
    }

    #[tokio::test]
    async fn upsert_user_is_idempotent_with_same_hash() {
        let store = setup().await;
        let id1 = store.upsert_user("u@x.test", "hash1").await.unwrap();
        let id2 = store.upsert_user("u@x.test", "hash1").await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn upsert_user_conflicts_on_hash_mismatch() {
        let store = setup().await;
        store.upsert_user("u@x.test", "hash1").await.unwrap();
        let err = store.upsert_user("u@x.test", "hash2").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn create_subscriptions_skips_exact_duplicates() {
        let store = setup().await;
        let user_id = store.upsert_user("u@x.test", "h").await.unwrap();
        let target_id = seed_one_target(&store).await;
        let date = NaiveDate::from_ymd_opt(2099, 2, 14).unwrap();
        let today = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

        let first = store
            .create_subscriptions(user_id, &[target_id], &[date], today)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = store
            .create_subscriptions(user_id, &[target_id], &[date], today)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn create_subscriptions_rejects_past_dates() {
        let store = setup().await;
        let user_id = store.upsert_user("u@x.test", "h").await.unwrap();
        let target_id = seed_one_target(&store).await;
        let past = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        let created = store
            .create_subscriptions(user_id, &[target_id], &[past], today)
            .await
            .unwrap();
        assert!(created.is_empty());
    }

    #[tokio::test]
    async fn list_active_excludes_notified() {
        let store = setup().await;
        let user_id = store.upsert_user("u@x.test", "h").await.unwrap();
        let target_id = seed_one_target(&store).await;
        let date = NaiveDate::from_ymd_opt(2099, 2, 14).unwrap();
        let today = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

        let ids = store
            .create_subscriptions(user_id, &[target_id], &[date], today)
            .await
            .unwrap();
        let sub_id = ids[0];

        assert_eq!(store.list_active().await.unwrap().len(), 1);

        store
            .mark_state(sub_id, SubscriptionState::Notified)
            .await
            .unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn delete_expired_is_idempotent() {
        let store = setup().await;
        let user_id = store.upsert_user("u@x.test", "h").await.unwrap();
        let target_id = seed_one_target(&store).await;
        let past = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let ancient = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();

        store
            .create_subscriptions(user_id, &[target_id], &[past], ancient)
            .await
            .unwrap();

        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let deleted_first = store.delete_expired(now).await.unwrap();
        assert_eq!(deleted_first, 1);

        let deleted_second = store.delete_expired(now).await.unwrap();
        assert_eq!(deleted_second, 0);
    }

    #[tokio::test]
    async fn delete_subscription_forbids_non_owner() {
        let store = setup().await;
        let owner = store.upsert_user("owner@x.test", "h").await.unwrap();
        let other = store.upsert_user("other@x.test", "h").await.unwrap();
        let target_id = seed_one_target(&store).await;
        let date = NaiveDate::from_ymd_opt(2099, 2, 14).unwrap();
        let today = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

        let ids = store
            .create_subscriptions(owner, &[target_id], &[date], today)
            .await
            .unwrap();

        let err = store.delete_subscription(ids[0], other).await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden));

        store.delete_subscription(ids[0], owner).await.unwrap();
    }

    #[tokio::test]
    async fn notification_survives_subscription_deletion() {
        let store = setup().await;
        let user_id = store.upsert_user("u@x.test", "h").await.unwrap();
        let target_id = seed_one_target(&store).await;
        let date = NaiveDate::from_ymd_opt(2099, 2, 14).unwrap();
        let today = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

        let ids = store
            .create_subscriptions(user_id, &[target_id], &[date], today)
            .await
            .unwrap();
        let sub_id = ids[0];

        store
            .record_notification(user_id, sub_id, "Test Resort", date)
            .await
            .unwrap();

        store.delete_subscription(sub_id, user_id).await.unwrap();

        let notifications = store.list_notifications_for_user(user_id).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].subscription_id, None);
        assert_eq!(notifications[0].target_name, "Test Resort");
    }

    #[tokio::test]
    async fn delete_user_cascade_hard_deletes_notifications_and_subscriptions() {
        let store = setup().await;
        let user_id = store.upsert_user("u@x.test", "h").await.unwrap();
        let target_id = seed_one_target(&store).await;
        let date = NaiveDate::from_ymd_opt(2099, 2, 14).unwrap();
        let today = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

        let ids = store
            .create_subscriptions(user_id, &[target_id], &[date], today)
            .await
            .unwrap();
        let sub_id = ids[0];

        store
            .record_notification(user_id, sub_id, "Test Resort", date)
            .await
            .unwrap();

        store.delete_user_cascade(user_id).await.unwrap();

        let notifications = store.list_notifications_for_user(user_id).await.unwrap();
        assert!(
            notifications.is_empty(),
            "a user's notifications must be hard-deleted on cascade, not merely SET NULL"
        );

        let err = store.get_subscription(sub_id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn recent_notification_within_window_detects_soft_debounce() {
        let store = setup().await;
        let user_id = store.upsert_user("u@x.test", "h").await.unwrap();
        let target_id = seed_one_target(&store).await;
        let date = NaiveDate::from_ymd_opt(2099, 2, 14).unwrap();
        let today = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

        let ids = store
            .create_subscriptions(user_id, &[target_id], &[date], today)
            .await
            .unwrap();
        let sub_id = ids[0];

        store
            .record_notification(user_id, sub_id, "Test Resort", date)
            .await
            .unwrap();

        let long_ago = Utc::now() - chrono::Duration::days(1);
        assert!(store
            .recent_notification_within(sub_id, long_ago)
            .await
            .unwrap());

        let future = Utc::now() + chrono::Duration::days(1);
        assert!(!store
            .recent_notification_within(sub_id, future)
            .await
            .unwrap());
    }
}
