use std::env;
use std::time::Duration;

use crate::error::EngineError;

/// Everything the engine reads from the environment at startup, resolved
/// once into an immutable struct. No component consults `env::var` after
/// construction — see the "global mutable state" design note.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_from: String,
    pub link_signing_secret: String,
    pub public_base_url: String,
    pub default_zone: String,
    pub base_tick_interval: Duration,
    pub cooldown_min: Duration,
    pub cooldown_max: Duration,
    pub concurrent_session_cap: usize,
    pub session_use_bound: u32,
    pub pause_all_on_block: bool,
    pub soft_debounce_window: Duration,
    pub gluetun_base_url: Option<String>,
}

fn env_var(key: &str) -> Result<String, EngineError> {
    env::var(key).map_err(|_| EngineError::BadConfig(format!("{key} is not set")))
}

fn env_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Read the operator surface from the process environment. Fails
    /// loudly rather than silently defaulting anything that would be
    /// unsafe to guess (SMTP credentials, the link-signing secret).
    pub fn from_env() -> Result<Self, EngineError> {
        Ok(Config {
            database_url: env_var_or("DATABASE_URL", "sqlite:availability_watch.db"),
            smtp_host: env_var_or("SMTP_HOST", "localhost"),
            smtp_port: env_u64_or("SMTP_PORT", 587) as u16,
            smtp_username: env_var("SMTP_USERNAME")?,
            smtp_password: env_var("SMTP_PASSWORD")?,
            smtp_from: env_var_or("SMTP_FROM", "noreply@availability-watch.example"),
            link_signing_secret: env_var("LINK_SIGNING_SECRET")?,
            public_base_url: env_var_or("PUBLIC_BASE_URL", "http://localhost:8080"),
            default_zone: env_var_or("DEFAULT_ZONE", "America/Denver"),
            base_tick_interval: Duration::from_secs(env_u64_or("BASE_TICK_INTERVAL_SECS", 90)),
            cooldown_min: Duration::from_secs(env_u64_or("COOLDOWN_MIN_SECS", 240)),
            cooldown_max: Duration::from_secs(env_u64_or("COOLDOWN_MAX_SECS", 600)),
            concurrent_session_cap: env_u64_or("CONCURRENT_SESSION_CAP", 1) as usize,
            session_use_bound: env_u64_or("SESSION_USE_BOUND", 3) as u32,
            pause_all_on_block: env::var("PAUSE_ALL_ON_BLOCK")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            soft_debounce_window: Duration::from_secs(env_u64_or(
                "SOFT_DEBOUNCE_WINDOW_SECS",
                30 * 60,
            )),
            gluetun_base_url: env::var("GLUETUN_BASE_URL").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u64_or_falls_back_on_missing_or_bad_value() {
        assert_eq!(env_u64_or("AVAILABILITY_WATCH_TEST_UNSET_VAR", 42), 42);
    }
}
