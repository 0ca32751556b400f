use std::time::Duration;

use chrono_tz::Tz;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{error, info};

use crate::clock::Clock;
use crate::date_coder::DateCoder;
use crate::db::Store;
use crate::error::{MailError, NotifyError};
use crate::link_signer::LinkSigner;
use crate::model::{DeliveryStatus, Intent, SubscriptionId, SubscriptionState};

/// The SMTP transport collaborator. A trait so tests use a fake instead
/// of a real mail server, keeping the send behind a fallible await the
/// caller logs and absorbs rather than panics on.
#[async_trait::async_trait]
pub trait SmtpMailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError>;
}

/// Real SMTP client via `lettre`.
pub struct LettreMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl LettreMailer {
    pub fn new(
        smtp_host: &str,
        smtp_port: u16,
        username: &str,
        password: &str,
        from: String,
    ) -> Result<Self, MailError> {
        let creds = Credentials::new(username.to_string(), password.to_string());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
            .map_err(|e| MailError::Smtp(e.to_string()))?
            .port(smtp_port)
            .credentials(creds)
            .build();
        Ok(Self { transport, from })
    }
}

#[async_trait::async_trait]
impl SmtpMailer for LettreMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.from.parse().map_err(|e: lettre::address::AddressError| {
                MailError::Smtp(e.to_string())
            })?)
            .to(to.parse().map_err(|e: lettre::address::AddressError| {
                MailError::Smtp(e.to_string())
            })?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| MailError::Smtp(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Smtp(e.to_string()))?;
        Ok(())
    }
}

/// The four-step notify contract: state gate, compose, transactional
/// record-then-send, soft same-subscription debounce.
pub struct Notifier {
    store: Store,
    mailer: Box<dyn SmtpMailer>,
    signer: LinkSigner,
    clock: Box<dyn Clock>,
    public_base_url: String,
    soft_debounce_window: Duration,
}

impl Notifier {
    pub fn new(
        store: Store,
        mailer: Box<dyn SmtpMailer>,
        signer: LinkSigner,
        clock: Box<dyn Clock>,
        public_base_url: String,
        soft_debounce_window: Duration,
    ) -> Self {
        Self {
            store,
            mailer,
            signer,
            clock,
            public_base_url,
            soft_debounce_window,
        }
    }

    pub async fn notify(
        &self,
        sub_id: SubscriptionId,
        owner_email: &str,
        owner_zone: &str,
        target_name: &str,
    ) -> Result<(), NotifyError> {
        let (subscription, _user, _target) = self.store.get_subscription(sub_id).await?;

        if subscription.state != SubscriptionState::Active {
            return Ok(());
        }

        let since = self.clock.now() - chrono::Duration::from_std(self.soft_debounce_window)
            .unwrap_or(chrono::Duration::zero());
        if self.store.recent_notification_within(sub_id, since).await? {
            info!("subscription {sub_id} suppressed by soft debounce window");
            return Ok(());
        }

        let zone: Tz = owner_zone.parse().unwrap_or(chrono_tz::UTC);
        let date_label = DateCoder::encode(subscription.target_date, zone);
        let subject = format!("{target_name} has availability on {date_label}");
        let resume_link = format!(
            "{}/continue-monitoring/{}",
            self.public_base_url,
            self.signer.issue(sub_id, Intent::Resume)
        );
        let stop_link = format!(
            "{}/stop-monitoring/{}",
            self.public_base_url,
            self.signer.issue(sub_id, Intent::Stop)
        );
        let body = format!(
            "<p>{target_name} now shows availability on <strong>{date_label}</strong>.</p>\
             <p><a href=\"{}\">Book now</a></p>\
             <p>Already booked it? <a href=\"{stop_link}\">Stop watching this date</a>.</p>\
             <p>Didn't book it yet and want us to keep watching? <a href=\"{resume_link}\">Resume watching</a>.</p>",
            self.public_base_url,
        );

        let notification_id = self
            .store
            .record_notification(subscription.user_id, sub_id, target_name, subscription.target_date)
            .await?;

        match self.mailer.send(owner_email, &subject, &body).await {
            Ok(()) => {
                self.store
                    .update_notification_status(notification_id, DeliveryStatus::Sent)
                    .await?;
                self.store
                    .mark_state(sub_id, SubscriptionState::Notified)
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!("smtp send failed for subscription {sub_id}: {e}");
                self.store
                    .update_notification_status(notification_id, DeliveryStatus::Failed)
                    .await?;
                Err(NotifyError::Send(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;
    use crate::db::TargetSeed;
    use crate::model::Rgb;
    use chrono::{NaiveDate, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingMailer {
        sends: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl SmtpMailer for CountingMailer {
        async fn send(&self, _to: &str, _subject: &str, _html_body: &str) -> Result<(), MailError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MailError::Smtp("simulated failure".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn seeded_subscription(store: &Store) -> SubscriptionId {
        store
            .seed_targets(&[TargetSeed {
                name: "Test Resort",
                calendar_url: "https://example.test/calendar",
                available_rgb: Rgb(49, 200, 25),
                check_cadence_hint_secs: 120,
            }])
            .await
            .unwrap();
        let user_id = store.upsert_user("u@x.test", "h").await.unwrap();
        let row = sqlx::query("SELECT id FROM targets WHERE name = 'Test Resort'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let target_id: i64 = sqlx::Row::try_get(&row, "id").unwrap();
        let date = NaiveDate::from_ymd_opt(2099, 2, 14).unwrap();
        let today = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let ids = store
            .create_subscriptions(user_id, &[target_id], &[date], today)
            .await
            .unwrap();
        ids[0]
    }

    #[tokio::test]
    async fn notify_sends_and_transitions_to_notified() {
        let store = Store::open_in_memory().await.unwrap();
        let sub_id = seeded_subscription(&store).await;
        let sends = Arc::new(AtomicUsize::new(0));
        let mailer = Box::new(CountingMailer { sends: sends.clone(), fail: false });
        let signer = LinkSigner::new("secret");
        let clock = Box::new(FixedClock::new(Utc::now()));

        let notifier = Notifier::new(
            store.clone(),
            mailer,
            signer,
            clock,
            "https://watch.example".into(),
            Duration::from_secs(1800),
        );

        notifier
            .notify(sub_id, "u@x.test", "America/Denver", "Test Resort")
            .await
            .unwrap();

        assert_eq!(sends.load(Ordering::SeqCst), 1);
        let (subscription, _, _) = store.get_subscription(sub_id).await.unwrap();
        assert_eq!(subscription.state, SubscriptionState::Notified);
    }

    #[tokio::test]
    async fn notify_is_a_no_op_when_already_notified() {
        let store = Store::open_in_memory().await.unwrap();
        let sub_id = seeded_subscription(&store).await;
        store.mark_state(sub_id, SubscriptionState::Notified).await.unwrap();

        let sends = Arc::new(AtomicUsize::new(0));
        let mailer = Box::new(CountingMailer { sends: sends.clone(), fail: false });
        let notifier = Notifier::new(
            store.clone(),
            mailer,
            LinkSigner::new("secret"),
            Box::new(FixedClock::new(Utc::now())),
            "https://watch.example".into(),
            Duration::from_secs(1800),
        );

        notifier
            .notify(sub_id, "u@x.test", "America/Denver", "Test Resort")
            .await
            .unwrap();

        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn notify_leaves_state_active_on_smtp_failure() {
        let store = Store::open_in_memory().await.unwrap();
        let sub_id = seeded_subscription(&store).await;

        let sends = Arc::new(AtomicUsize::new(0));
        let mailer = Box::new(CountingMailer { sends: sends.clone(), fail: true });
        let notifier = Notifier::new(
            store.clone(),
            mailer,
            LinkSigner::new("secret"),
            Box::new(FixedClock::new(Utc::now())),
            "https://watch.example".into(),
            Duration::from_secs(1800),
        );

        let result = notifier
            .notify(sub_id, "u@x.test", "America/Denver", "Test Resort")
            .await;

        assert!(result.is_err());
        let (subscription, _, _) = store.get_subscription(sub_id).await.unwrap();
        assert_eq!(subscription.state, SubscriptionState::Active);
    }

    #[tokio::test]
    async fn soft_debounce_suppresses_repeat_within_window() {
        let store = Store::open_in_memory().await.unwrap();
        let sub_id = seeded_subscription(&store).await;
        store
            .record_notification(1, sub_id, "Test Resort", NaiveDate::from_ymd_opt(2099, 2, 14).unwrap())
            .await
            .unwrap();

        let sends = Arc::new(AtomicUsize::new(0));
        let mailer = Box::new(CountingMailer { sends: sends.clone(), fail: false });
        let notifier = Notifier::new(
            store.clone(),
            mailer,
            LinkSigner::new("secret"),
            Box::new(FixedClock::new(Utc::now())),
            "https://watch.example".into(),
            Duration::from_secs(1800),
        );

        notifier
            .notify(sub_id, "u@x.test", "America/Denver", "Test Resort")
            .await
            .unwrap();

        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }
}
