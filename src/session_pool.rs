use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use log::{info, warn};
use rand::Rng;
use thirtyfour::prelude::*;

use crate::error::PoolError;
use crate::model::TargetId;

struct SessionEntry {
    driver: WebDriver,
    profile_dir: PathBuf,
    use_count: u32,
    last_acquired: Instant,
}

/// At most `concurrent_cap` live browser sessions at once, one per
/// Target, each recycled after a bounded number of uses. Owned
/// exclusively by the Scheduler task — no internal locking.
pub struct SessionPool {
    webdriver_url: String,
    profile_root: PathBuf,
    concurrent_cap: usize,
    use_count_bound: u32,
    sessions: HashMap<TargetId, SessionEntry>,
}

impl SessionPool {
    pub fn new(
        webdriver_url: String,
        profile_root: PathBuf,
        concurrent_cap: usize,
        use_count_bound: u32,
    ) -> Self {
        Self {
            webdriver_url,
            profile_root,
            // Hard ceiling of 2 per the concurrency model, regardless of
            // what the operator configures.
            concurrent_cap: concurrent_cap.clamp(1, 2),
            use_count_bound,
            sessions: HashMap::new(),
        }
    }

    /// Returns a live session for `target_id` and whether it was just
    /// created (the Fetcher needs this to pick its settle-delay branch).
    pub async fn acquire(&mut self, target_id: TargetId) -> Result<(WebDriver, bool), PoolError> {
        if let Some(entry) = self.sessions.get(&target_id) {
            if entry.use_count >= self.use_count_bound {
                info!("target {target_id} session hit its use bound, recycling");
                self.evict(target_id, false).await?;
            } else if !Self::is_alive(&entry.driver).await {
                warn!("target {target_id} session is no longer responsive, recreating");
                self.evict(target_id, false).await?;
            }
        }

        if let Some(entry) = self.sessions.get_mut(&target_id) {
            entry.use_count += 1;
            entry.last_acquired = Instant::now();
            return Ok((entry.driver.clone(), false));
        }

        self.make_room_for(target_id).await?;
        let driver = self.create_session(target_id).await?;
        Ok((driver, true))
    }

    /// No-op between ticks: a live session simply remains in the pool
    /// until its next acquire, recycling boundary, or eviction.
    pub fn release(&self, _target_id: TargetId) {}

    async fn is_alive(driver: &WebDriver) -> bool {
        driver.current_url().await.is_ok()
    }

    async fn make_room_for(&mut self, incoming: TargetId) -> Result<(), PoolError> {
        if self.sessions.len() < self.concurrent_cap {
            return Ok(());
        }

        let lru_target = self
            .sessions
            .iter()
            .filter(|(id, _)| **id != incoming)
            .min_by_key(|(_, entry)| entry.last_acquired)
            .map(|(id, _)| *id);

        if let Some(target_id) = lru_target {
            info!("evicting target {target_id} to make room for target {incoming}");
            self.evict(target_id, false).await?;
        }
        Ok(())
    }

    async fn create_session(&mut self, target_id: TargetId) -> Result<WebDriver, PoolError> {
        let profile_dir = self.profile_root.join(format!("target-{target_id}"));
        let mut caps = DesiredCapabilities::chrome();
        caps.add_arg(&format!("--user-data-dir={}", profile_dir.display()))
            .map_err(|e| PoolError::CreateFailed(e.to_string()))?;
        caps.add_arg("--disable-blink-features=AutomationControlled")
            .map_err(|e| PoolError::CreateFailed(e.to_string()))?;

        let (width, height) = Self::random_viewport();
        caps.add_arg(&format!("--window-size={width},{height}"))
            .map_err(|e| PoolError::CreateFailed(e.to_string()))?;

        let driver = WebDriver::new(&self.webdriver_url, caps)
            .await
            .map_err(|e| PoolError::CreateFailed(e.to_string()))?;

        self.sessions.insert(
            target_id,
            SessionEntry {
                driver: driver.clone(),
                profile_dir,
                use_count: 1,
                last_acquired: Instant::now(),
            },
        );

        Ok(driver)
    }

    /// Tears down the session for `target_id`. When `scrub_profile`, also
    /// removes its on-disk browser profile so the next session starts
    /// with a clean fingerprint, retrying the removal a few times in
    /// case the driver process hasn't released its file handles yet.
    pub async fn evict(&mut self, target_id: TargetId, scrub_profile: bool) -> Result<(), PoolError> {
        let Some(entry) = self.sessions.remove(&target_id) else {
            return Ok(());
        };

        if let Err(e) = entry.driver.quit().await {
            warn!("target {target_id} session teardown failed: {e}");
        }

        if scrub_profile {
            Self::scrub_profile_dir(&entry.profile_dir).await;
        }

        Ok(())
    }

    async fn scrub_profile_dir(dir: &PathBuf) {
        for attempt in 1..=3 {
            if tokio::fs::remove_dir_all(dir).await.is_ok() {
                return;
            }
            if attempt < 3 {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }

    /// Shutdown hook: tears down every live session without scrubbing
    /// profiles (a graceful process exit, not a block response).
    pub async fn evict_all(&mut self) {
        let target_ids: Vec<TargetId> = self.sessions.keys().copied().collect();
        for target_id in target_ids {
            let _ = self.evict(target_id, false).await;
        }
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// A randomized but plausible desktop viewport, picked fresh per
    /// session so every Target doesn't present the same window fingerprint.
    fn random_viewport() -> (u32, u32) {
        let width = rand::thread_rng().gen_range(1200..1440);
        let height = rand::thread_rng().gen_range(800..960);
        (width, height)
    }
}
