use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;
use rand::Rng;
use thirtyfour::prelude::*;

use crate::date_coder::DateCoder;
use crate::error::FetchError;
use crate::model::Target;

/// The raw document the Classifier reasons over. Just the serialized DOM;
/// the Fetcher never interprets it.
#[derive(Debug, Clone)]
pub struct DomSnapshot {
    pub html: String,
}

/// Everything besides the DOM itself that carries block-detection signal:
/// final URL after redirects, document title, and whatever console
/// messages the driver surfaced.
#[derive(Debug, Clone, Default)]
pub struct SideChannel {
    pub final_url: String,
    pub title: String,
    pub console_messages: Vec<String>,
}

/// Drives a single controlled browser session to a Target's calendar and
/// returns a DOM snapshot plus the side channel. One retry on a transient
/// connection error; no retry on anything else (a dead session is the
/// SessionPool's problem to recreate, not the Fetcher's to paper over).
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        session: &WebDriver,
        target: &Target,
        dates: &[NaiveDate],
        zone: Tz,
        is_new_session: bool,
    ) -> Result<(DomSnapshot, SideChannel), FetchError>;
}

/// Real implementation over the WebDriver protocol.
pub struct WebDriverFetcher {
    pub navigation_timeout: Duration,
    pub first_element_timeout: Duration,
}

impl Default for WebDriverFetcher {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            first_element_timeout: Duration::from_secs(10),
        }
    }
}

/// Transient connection-level errors get one retry; anything else
/// (stale session, navigation refused) is the SessionPool's problem.
enum FetchFailure {
    Transient(FetchError),
    Fatal(FetchError),
}

impl FetchFailure {
    fn into_inner(self) -> FetchError {
        match self {
            FetchFailure::Transient(e) | FetchFailure::Fatal(e) => e,
        }
    }
}

fn classify(err: &WebDriverError) -> FetchFailure {
    let text = err.to_string().to_lowercase();
    let is_transient = text.contains("connection refused")
        || text.contains("connection reset")
        || text.contains("broken pipe");
    if is_transient {
        FetchFailure::Transient(FetchError::WebDriver(err.to_string()))
    } else {
        FetchFailure::Fatal(FetchError::Broken(err.to_string()))
    }
}

#[async_trait::async_trait]
impl Fetcher for WebDriverFetcher {
    async fn fetch(
        &self,
        session: &WebDriver,
        target: &Target,
        dates: &[NaiveDate],
        zone: Tz,
        is_new_session: bool,
    ) -> Result<(DomSnapshot, SideChannel), FetchError> {
        match self
            .fetch_once(session, target, dates, zone, is_new_session)
            .await
        {
            Ok(result) => Ok(result),
            Err(FetchFailure::Transient(_)) => self
                .fetch_once(session, target, dates, zone, is_new_session)
                .await
                .map_err(FetchFailure::into_inner),
            Err(fatal) => Err(fatal.into_inner()),
        }
    }
}

impl WebDriverFetcher {
    async fn fetch_once(
        &self,
        session: &WebDriver,
        target: &Target,
        dates: &[NaiveDate],
        zone: Tz,
        is_new_session: bool,
    ) -> Result<(DomSnapshot, SideChannel), FetchFailure> {
        tokio::time::timeout(self.navigation_timeout, session.goto(&target.calendar_url))
            .await
            .map_err(|_| FetchFailure::Fatal(FetchError::Timeout))?
            .map_err(|e| classify(&e))?;

        // A freshly created session settles longer (cold cache, first-paint
        // jitter) than a reused one.
        let settle = if is_new_session {
            Duration::from_millis(rand::thread_rng().gen_range(10_000..15_000))
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(3_000..5_000))
        };
        tokio::time::sleep(settle).await;

        self.simulate_human_behavior(session).await;

        if let Some(&first_date) = dates.first() {
            let label = DateCoder::encode(first_date, zone);
            let selector = format!("[aria-label=\"{label}\"]");
            let _ = tokio::time::timeout(
                self.first_element_timeout,
                session.query(By::Css(&selector)).first(),
            )
            .await;
            // Deliberately ignored: the Classifier treats an absent
            // element as NOT_FOUND, not a fetch failure. The snapshot is
            // taken regardless of whether the wait succeeded.
        }

        let html = session.source().await.map_err(|e| classify(&e))?;
        let final_url = session
            .current_url()
            .await
            .map(|u| u.to_string())
            .unwrap_or_default();
        let title = session.title().await.unwrap_or_default();
        let console_messages = self.collect_console_logs(session).await;

        Ok((
            DomSnapshot { html },
            SideChannel {
                final_url,
                title,
                console_messages,
            },
        ))
    }

    /// A few small scroll deltas with short pauses in between, via
    /// `execute_script`, plus an occasional hover over an interactive
    /// element.
    async fn simulate_human_behavior(&self, session: &WebDriver) {
        let scroll_steps = rand::thread_rng().gen_range(1..=3);
        for _ in 0..scroll_steps {
            let dy = rand::thread_rng().gen_range(80..400);
            let _ = session
                .execute(&format!("window.scrollBy(0, {dy});"), vec![])
                .await;
            let pause = rand::thread_rng().gen_range(200..800);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }

        if rand::thread_rng().gen_bool(0.4) {
            self.hover_random_element(session).await;
        }
    }

    /// Moves the mouse over a randomly chosen interactive element, if any
    /// are present. Best-effort: a page with nothing to hover over is not
    /// an error.
    async fn hover_random_element(&self, session: &WebDriver) {
        let Ok(elements) = session.query(By::Css("a, button, input")).all_from_selector().await
        else {
            return;
        };
        if elements.is_empty() {
            return;
        }
        let index = rand::thread_rng().gen_range(0..elements.len());
        let actions = session.action_chain();
        let _ = actions.move_to_element_center(&elements[index]).perform().await;
    }

    /// Best-effort: not every WebDriver endpoint exposes browser console
    /// logs. An empty vec is a legitimate outcome the Classifier tolerates.
    async fn collect_console_logs(&self, session: &WebDriver) -> Vec<String> {
        match session
            .execute(
                "return (window.__consoleCapture || []).map(String);",
                vec![],
            )
            .await
        {
            Ok(value) => value
                .json()
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}
