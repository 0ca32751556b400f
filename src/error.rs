use thiserror::Error;

/// Store-level failures. `Conflict`/`Forbidden` propagate to a caller
/// (a dashboard or link handler); everything else is a `Fatal` to the
/// Scheduler, which halts rather than risk operating on a broken store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("user already exists with a different credential hash")]
    Conflict,
    #[error("caller does not own this subscription")]
    Forbidden,
    #[error("subscription not found")]
    NotFound,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Errors the Fetcher surfaces. Classification of BLOCKED vs FAILED is the
/// Classifier's job; the Fetcher only ever reports that *something about
/// the transport* went wrong.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("browser session is unusable: {0}")]
    Broken(String),
    #[error("navigation timed out")]
    Timeout,
    #[error("webdriver error: {0}")]
    WebDriver(String),
}

/// Errors from the SessionPool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to create browser session: {0}")]
    CreateFailed(String),
    #[error("failed to tear down browser session: {0}")]
    TeardownFailed(String),
}

/// Errors from identity rotation.
#[derive(Error, Debug)]
pub enum RotateError {
    #[error("could not reach rotation control plane: {0}")]
    Unreachable(String),
    #[error("rotation did not produce a new identity after retrying")]
    NoNewIdentity,
}

/// Errors sending mail.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("smtp send failed: {0}")]
    Smtp(String),
}

/// Errors from the Notifier's `notify` call.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Send(#[from] MailError),
}

/// Errors verifying or issuing signed links.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token intent does not match the requested intent")]
    WrongIntent,
}

/// A date string that does not parse as either an ISO date or an
/// aria-label. Caller bug or corrupt row; the tick that produced it is
/// skipped, not crashed.
#[derive(Error, Debug)]
#[error("invalid date: {0}")]
pub struct BadDateError(pub String);

/// Conditions the Scheduler loop treats as fatal: the store is
/// unreachable or the clock has gone inconsistent (observed `now` moved
/// backwards). Anything else is absorbed at the tick boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store unreachable: {0}")]
    StoreUnreachable(#[from] StoreError),
    #[error("clock went backwards: last tick at {last}, now {now}")]
    ClockInconsistent { last: String, now: String },
    #[error("required configuration missing or invalid: {0}")]
    BadConfig(String),
    #[error("session pool error: {0}")]
    Pool(#[from] PoolError),
}
