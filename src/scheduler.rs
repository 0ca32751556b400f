use std::collections::{BTreeMap, HashMap};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::{error, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::classifier::classify;
use crate::clock::Clock;
use crate::db::Store;
use crate::error::{EngineError, StoreError};
use crate::fetcher::Fetcher;
use crate::identity_rotator::IdentityRotator;
use crate::model::{ActiveSubscription, CheckLog, CheckOutcome, Target, TargetId, Verdict};
use crate::notifier::Notifier;
use crate::session_pool::SessionPool;

/// Everything the control loop needs that isn't a collaborator object:
/// cadence knobs read once from `Config` at construction.
pub struct SchedulerConfig {
    pub default_zone: Tz,
    pub base_tick_interval: StdDuration,
    pub cooldown_min: StdDuration,
    pub cooldown_max: StdDuration,
    pub pause_all_on_block: bool,
}

/// All subscriptions sharing a Target, visited in one browser session per
/// tick.
struct TargetGroup {
    target: Target,
    subs: Vec<ActiveSubscription>,
}

/// Groups `ListActive`'s flat rows by Target. Pure, so it's unit-testable
/// without a Store or a browser.
fn group_by_target(subs: Vec<ActiveSubscription>) -> Vec<TargetGroup> {
    let mut order: Vec<TargetId> = Vec::new();
    let mut groups: HashMap<TargetId, TargetGroup> = HashMap::new();

    for sub in subs {
        let target_id = sub.target.id;
        groups
            .entry(target_id)
            .or_insert_with(|| {
                order.push(target_id);
                TargetGroup {
                    target: sub.target.clone(),
                    subs: Vec::new(),
                }
            })
            .subs
            .push(sub);
    }

    order.into_iter().filter_map(|id| groups.remove(&id)).collect()
}

/// Whether a completed classification round counts as a useful check.
/// BLOCKED, or every date NOT_FOUND with no block markers, is FAILED;
/// anything that actually rendered a date cell is SUCCESS.
fn check_outcome(verdicts: &BTreeMap<chrono::NaiveDate, Verdict>) -> (CheckOutcome, bool) {
    let any_available = verdicts.values().any(|v| *v == Verdict::Available);
    let any_blocked = verdicts.values().any(|v| *v == Verdict::Blocked);
    let all_not_found = !verdicts.is_empty() && verdicts.values().all(|v| *v == Verdict::NotFound);

    let outcome = if any_blocked || all_not_found {
        CheckOutcome::Failed
    } else {
        CheckOutcome::Success
    };
    (outcome, any_available)
}

/// The heart of the system: periodic tick, grouped-by-Target browser
/// visits, Classifier dispatch, Notifier calls, block-aware backoff.
/// Owns the SessionPool exclusively — no other task touches it.
pub struct Scheduler {
    store: Store,
    session_pool: SessionPool,
    fetcher: Box<dyn Fetcher>,
    identity_rotator: Box<dyn IdentityRotator>,
    notifier: Notifier,
    clock: Box<dyn Clock>,
    config: SchedulerConfig,
    blocked_until: HashMap<TargetId, DateTime<Utc>>,
    last_tick_at: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        session_pool: SessionPool,
        fetcher: Box<dyn Fetcher>,
        identity_rotator: Box<dyn IdentityRotator>,
        notifier: Notifier,
        clock: Box<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            session_pool,
            fetcher,
            identity_rotator,
            notifier,
            clock,
            config,
            blocked_until: HashMap::new(),
            last_tick_at: None,
        }
    }

    /// Runs the control loop until a FATAL condition halts it or
    /// `shutdown` resolves. `shutdown` races every sleep so a pending
    /// backoff never delays process exit.
    pub async fn run(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            match self.tick().await {
                Ok(sleep_for) => {
                    tokio::select! {
                        _ = self.clock.sleep(sleep_for) => {}
                        _ = &mut shutdown => break,
                    }
                }
                Err(e) => {
                    error!("fatal engine error, halting scheduler: {e}");
                    break;
                }
            }

            if shutdown.try_recv().is_ok() {
                break;
            }
        }

        info!("scheduler stopping; evicting all browser sessions");
        self.session_pool.evict_all().await;
    }

    /// One iteration: GC expired subscriptions, group actives by Target,
    /// visit each group at most once, dispatch verdicts, compute the next
    /// sleep. Returns `Err` only for the FATAL conditions: an unreachable
    /// store, or the clock observed moving backwards.
    async fn tick(&mut self) -> Result<StdDuration, EngineError> {
        let now = self.clock.now();
        if let Some(last) = self.last_tick_at {
            if now < last {
                return Err(EngineError::ClockInconsistent {
                    last: last.to_rfc3339(),
                    now: now.to_rfc3339(),
                });
            }
        }
        self.last_tick_at = Some(now);

        let deleted = self.store.delete_expired(now).await.map_err(fatal_store)?;
        if deleted > 0 {
            info!("expiry sweep removed {deleted} subscription(s)");
        }

        let subs = self.store.list_active().await.map_err(fatal_store)?;
        if subs.is_empty() {
            info!("no active subscriptions; waiting");
            return Ok(self.normal_sleep());
        }

        let mut groups = group_by_target(subs);
        groups.shuffle(&mut rand::thread_rng());

        let mut available_count = 0u32;
        let mut unavailable_count = 0u32;
        let mut not_found_count = 0u32;
        let mut blocked_targets: Vec<String> = Vec::new();
        let mut any_blocked_this_tick = false;

        for (idx, group) in groups.into_iter().enumerate() {
            if idx > 0 {
                let jitter = rand::thread_rng().gen_range(500..3_000);
                self.clock
                    .sleep(StdDuration::from_millis(jitter))
                    .await;
            }

            if let Some(until) = self.blocked_until.get(&group.target.id) {
                if now < *until {
                    continue;
                }
            }

            match self.visit_group(&group, now).await {
                Err(e @ EngineError::StoreUnreachable(_)) | Err(e @ EngineError::ClockInconsistent { .. }) => {
                    return Err(e);
                }
                Ok((outcome, found_available, verdicts)) => {
                    for v in verdicts.values() {
                        match v {
                            Verdict::Available => available_count += 1,
                            Verdict::Unavailable => unavailable_count += 1,
                            Verdict::NotFound => not_found_count += 1,
                            Verdict::Blocked => {}
                        }
                    }

                    if verdicts.values().any(|v| *v == Verdict::Blocked) {
                        warn!("target {} BLOCKED", group.target.name);
                        blocked_targets.push(group.target.name.clone());
                        any_blocked_this_tick = true;

                        if let Err(e) = self.session_pool.evict(group.target.id, true).await {
                            warn!("failed to evict blocked session for {}: {e}", group.target.name);
                        }

                        let cooldown = self.random_cooldown();
                        self.blocked_until.insert(group.target.id, now + chrono::Duration::from_std(cooldown).unwrap_or_default());
                    }

                    let _ = outcome;
                    let _ = found_available;
                }
                Err(e) => {
                    warn!("check for target {} failed: {e}", group.target.name);
                }
            }
        }

        if any_blocked_this_tick {
            info!(
                "tick summary: {available_count} available, {unavailable_count} unavailable, \
                 {not_found_count} not_found, blocked targets: {blocked_targets:?}"
            );
        } else {
            info!(
                "tick summary: {available_count} available, {unavailable_count} unavailable, \
                 {not_found_count} not_found"
            );
        }

        if any_blocked_this_tick && self.config.pause_all_on_block {
            self.session_pool.evict_all().await;
            match self.identity_rotator.rotate().await {
                Ok((old, new)) => info!("identity rotated: {old} -> {new}"),
                Err(e) => warn!("identity rotation failed: {e}"),
            }
            return Ok(self.random_cooldown());
        }

        Ok(self.normal_sleep())
    }

    /// One browser visit for a single Target: acquire session, fetch,
    /// classify, record the check, dispatch verdicts to subscriptions.
    /// One retry on `FetchError::Broken` before giving up on the group.
    async fn visit_group(
        &mut self,
        group: &TargetGroup,
        now: DateTime<Utc>,
    ) -> Result<(CheckOutcome, bool, BTreeMap<chrono::NaiveDate, Verdict>), EngineError> {
        let dates: Vec<chrono::NaiveDate> = group.subs.iter().map(|s| s.subscription.target_date).collect();
        let zone = self.config.default_zone;

        let (session, is_new) = self
            .session_pool
            .acquire(group.target.id)
            .await
            .map_err(EngineError::Pool)?;

        let started = std::time::Instant::now();
        let fetch_result = self
            .fetcher
            .fetch(&session, &group.target, &dates, zone, is_new)
            .await;

        let fetch_result = match fetch_result {
            Ok(r) => Ok(r),
            Err(crate::error::FetchError::Broken(_)) => {
                warn!("target {} session broken, evicting and retrying once", group.target.name);
                let _ = self.session_pool.evict(group.target.id, false).await;
                let (session, _) = self
                    .session_pool
                    .acquire(group.target.id)
                    .await
                    .map_err(EngineError::Pool)?;
                self.fetcher
                    .fetch(&session, &group.target, &dates, zone, true)
                    .await
            }
            Err(e) => Err(e),
        };

        let elapsed_ms = started.elapsed().as_millis() as i64;

        let (dom, side) = match fetch_result {
            Ok(result) => result,
            Err(e) => {
                self.store
                    .record_check(&CheckLog {
                        target_id: group.target.id,
                        outcome: CheckOutcome::Failed,
                        elapsed_ms,
                        found_available: false,
                        err_text: Some(e.to_string()),
                    })
                    .await
                    .map_err(fatal_store)?;
                return Ok((CheckOutcome::Failed, false, BTreeMap::new()));
            }
        };

        let verdicts = classify(&dom, &side, &dates, group.target.available_rgb, zone);
        let (outcome, found_available) = check_outcome(&verdicts);

        self.store
            .record_check(&CheckLog {
                target_id: group.target.id,
                outcome,
                elapsed_ms,
                found_available,
                err_text: None,
            })
            .await
            .map_err(fatal_store)?;

        for sub in &group.subs {
            self.store
                .touch_last_checked(sub.subscription.id, now)
                .await
                .map_err(fatal_store)?;

            match verdicts.get(&sub.subscription.target_date) {
                Some(Verdict::Available) => {
                    if let Err(e) = self
                        .notifier
                        .notify(
                            sub.subscription.id,
                            &sub.owner_email,
                            &sub.owner_zone,
                            &group.target.name,
                        )
                        .await
                    {
                        warn!("notify failed for subscription {}: {e}", sub.subscription.id);
                    }
                    self.store
                        .increment_success_count(sub.subscription.id)
                        .await
                        .map_err(fatal_store)?;
                }
                Some(Verdict::Blocked) | Some(Verdict::Unavailable) | Some(Verdict::NotFound) | None => {}
            }
        }

        Ok((outcome, found_available, verdicts))
    }

    fn normal_sleep(&self) -> StdDuration {
        let jitter = rand::thread_rng().gen_range(0..30);
        self.config.base_tick_interval + StdDuration::from_secs(jitter)
    }

    fn random_cooldown(&self) -> StdDuration {
        let min = self.config.cooldown_min.as_secs();
        let max = self.config.cooldown_max.as_secs().max(min + 1);
        StdDuration::from_secs(rand::thread_rng().gen_range(min..max))
    }
}

fn fatal_store(e: StoreError) -> EngineError {
    EngineError::StoreUnreachable(e)
}
