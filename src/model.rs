use chrono::NaiveDate;
use strum::{Display, EnumString};

pub type UserId = i64;
pub type TargetId = i64;
pub type SubscriptionId = i64;
pub type NotificationId = i64;

/// An RGB triple, e.g. the canonical "available" marker color for a Target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub credential_hash: String,
    pub display_name: Option<String>,
    pub zone: String,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub calendar_url: String,
    pub available_rgb: Rgb,
    pub check_cadence_hint_secs: i64,
}

/// Subscription state machine: ACTIVE -> NOTIFIED -> ACTIVE (resume), or
/// ACTIVE/NOTIFIED -> deleted (stop, or expiry GC). There is no `Deleted`
/// variant: a deleted subscription is simply absent from the Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum SubscriptionState {
    #[strum(serialize = "ACTIVE")]
    Active,
    #[strum(serialize = "NOTIFIED")]
    Notified,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub target_id: TargetId,
    pub target_date: NaiveDate,
    pub state: SubscriptionState,
    pub priority: i64,
    pub success_count: i64,
}

/// A Subscription joined with its owner's email and the Target it
/// watches — the shape `Store::list_active` returns, since the
/// Scheduler needs both without a second round-trip.
#[derive(Debug, Clone)]
pub struct ActiveSubscription {
    pub subscription: Subscription,
    pub owner_email: String,
    pub owner_zone: String,
    pub target: Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CheckOutcome {
    #[strum(serialize = "SUCCESS")]
    Success,
    #[strum(serialize = "FAILED")]
    Failed,
}

#[derive(Debug, Clone)]
pub struct CheckLog {
    pub target_id: TargetId,
    pub outcome: CheckOutcome,
    pub elapsed_ms: i64,
    pub found_available: bool,
    pub err_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeliveryStatus {
    #[strum(serialize = "sent")]
    Sent,
    #[strum(serialize = "failed")]
    Failed,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub subscription_id: Option<SubscriptionId>,
    pub delivery_status: DeliveryStatus,
    pub target_name: String,
    pub target_date: NaiveDate,
}

/// The Classifier's exhaustive output per requested date: a closed sum
/// type the Scheduler pattern-matches exhaustively, rather than a loosely
/// typed string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Verdict {
    #[strum(serialize = "AVAILABLE")]
    Available,
    #[strum(serialize = "UNAVAILABLE")]
    Unavailable,
    #[strum(serialize = "NOT_FOUND")]
    NotFound,
    #[strum(serialize = "BLOCKED")]
    Blocked,
}

/// The intent carried by a signed RESUME/STOP link. Each intent uses a
/// distinct HMAC domain (salt) so a token for one can never verify under
/// the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Intent {
    #[strum(serialize = "RESUME")]
    Resume,
    #[strum(serialize = "STOP")]
    Stop,
}
