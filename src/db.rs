use std::str::FromStr;

use log::info;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::Rgb;

/// The handle every component holds. Wraps one pool; every operation in
/// `store.rs` is a single transactional call against it (single-writer
/// discipline).
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
}

/// A Target to seed idempotently on first boot.
pub struct TargetSeed {
    pub name: &'static str,
    pub calendar_url: &'static str,
    pub available_rgb: Rgb,
    pub check_cadence_hint_secs: i64,
}

impl Store {
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        if !sqlx::Sqlite::database_exists(database_url)
            .await
            .unwrap_or(false)
        {
            info!("creating database {database_url}");
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .connect_with(SqliteConnectOptions::from_str(database_url)?.foreign_keys(true))
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Sqlx(sqlx::Error::Migrate(Box::new(e))))?;

        Ok(Store { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Sqlx(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(Store { pool })
    }

    /// Idempotent boot-time seed of the monitored Targets. Uses
    /// `INSERT OR IGNORE` so re-running on every boot is harmless.
    pub async fn seed_targets(&self, seeds: &[TargetSeed]) -> Result<(), StoreError> {
        for seed in seeds {
            sqlx::query(
                "INSERT OR IGNORE INTO targets
                    (name, calendar_url, available_r, available_g, available_b, check_cadence_hint_secs)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(seed.name)
            .bind(seed.calendar_url)
            .bind(seed.available_rgb.0 as i64)
            .bind(seed.available_rgb.1 as i64)
            .bind(seed.available_rgb.2 as i64)
            .bind(seed.check_cadence_hint_secs)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
