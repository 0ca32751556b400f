use chrono_tz::Tz;

use crate::clock::Clock;
use crate::db::Store;
use crate::error::{SignerError, StoreError};
use crate::link_signer::LinkSigner;
use crate::model::{Intent, SubscriptionId, SubscriptionState};

/// Outcome of applying a signed link's intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkActionOutcome {
    Resumed,
    Stopped,
    /// The subscription named by the token no longer exists — treated as
    /// already-handled, not an error.
    AlreadyGone,
    /// RESUME was requested for a subscription whose date has already
    /// passed. Refused as the safer of the two possible behaviors.
    DateAlreadyPassed,
    TokenInvalid(SignerError),
}

/// Applies a verified RESUME/STOP token to the store. Framework-agnostic
/// so an HTTP handler can call it directly without pulling in a web
/// framework here.
pub async fn apply_link_token(
    store: &Store,
    signer: &LinkSigner,
    clock: &dyn Clock,
    default_zone: Tz,
    token: &str,
    intent: Intent,
) -> Result<LinkActionOutcome, StoreError> {
    let sub_id: SubscriptionId = match signer.verify(token, intent) {
        Ok(id) => id,
        Err(e) => return Ok(LinkActionOutcome::TokenInvalid(e)),
    };

    match intent {
        Intent::Resume => apply_resume(store, clock, default_zone, sub_id).await,
        Intent::Stop => apply_stop(store, sub_id).await,
    }
}

async fn apply_resume(
    store: &Store,
    clock: &dyn Clock,
    default_zone: Tz,
    sub_id: SubscriptionId,
) -> Result<LinkActionOutcome, StoreError> {
    let (subscription, user, _target) = match store.get_subscription(sub_id).await {
        Ok(found) => found,
        Err(StoreError::NotFound) => return Ok(LinkActionOutcome::AlreadyGone),
        Err(e) => return Err(e),
    };

    let zone: Tz = user.zone.parse().unwrap_or(default_zone);
    let today = clock.now().with_timezone(&zone).date_naive();
    if subscription.target_date < today {
        return Ok(LinkActionOutcome::DateAlreadyPassed);
    }

    store
        .mark_state(sub_id, SubscriptionState::Active)
        .await?;
    Ok(LinkActionOutcome::Resumed)
}

async fn apply_stop(store: &Store, sub_id: SubscriptionId) -> Result<LinkActionOutcome, StoreError> {
    let (subscription, _user, _target) = match store.get_subscription(sub_id).await {
        Ok(found) => found,
        Err(StoreError::NotFound) => return Ok(LinkActionOutcome::AlreadyGone),
        Err(e) => return Err(e),
    };

    store
        .delete_subscription(sub_id, subscription.user_id)
        .await?;
    Ok(LinkActionOutcome::Stopped)
}
