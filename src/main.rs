mod classifier;
mod clock;
mod config;
mod date_coder;
mod db;
mod error;
mod fetcher;
mod health;
mod identity_rotator;
mod link_actions;
mod link_signer;
mod model;
mod notifier;
mod scheduler;
mod session_pool;
mod store;

use std::path::PathBuf;

use dotenvy::dotenv;
use log::{error, info};

use clock::SystemClock;
use config::Config;
use db::{Store, TargetSeed};
use fetcher::WebDriverFetcher;
use identity_rotator::{GluetunRotator, IdentityRotator, NoopRotator};
use model::Rgb;
use notifier::{LettreMailer, Notifier};
use scheduler::{Scheduler, SchedulerConfig};
use session_pool::SessionPool;

/// The resorts this deployment watches out of the box. Seeded idempotently
/// on every boot (`INSERT OR IGNORE`); an operator adds more via direct
/// Store access or the (out-of-scope) subscription UI.
const DEFAULT_TARGETS: &[TargetSeed] = &[
    TargetSeed {
        name: "Brighton",
        calendar_url: "https://reservenski.parkbrightonresort.com/select-parking",
        available_rgb: Rgb(49, 200, 25),
        check_cadence_hint_secs: 120,
    },
    TargetSeed {
        name: "Solitude",
        calendar_url: "https://reservenski.parksolitude.com/select-parking",
        available_rgb: Rgb(49, 200, 25),
        check_cadence_hint_secs: 120,
    },
    TargetSeed {
        name: "Alta",
        calendar_url: "https://reserve.altaparking.com/select-parking",
        available_rgb: Rgb(49, 200, 25),
        check_cadence_hint_secs: 120,
    },
    TargetSeed {
        name: "Park City",
        calendar_url: "https://reserve.parkatparkcitymountain.com/select-parking",
        available_rgb: Rgb(49, 200, 25),
        check_cadence_hint_secs: 120,
    },
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    info!("Starting availability-watch engine...");

    let config = Config::from_env()?;

    let store = Store::open(&config.database_url).await?;
    store.seed_targets(DEFAULT_TARGETS).await?;
    info!("Database ready and default targets seeded.");

    let webdriver_url =
        std::env::var("WEBDRIVER_URL").unwrap_or_else(|_| "http://localhost:9515".to_string());
    let profile_root = std::env::var("BROWSER_PROFILE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./browser-profiles"));

    let session_pool = SessionPool::new(
        webdriver_url,
        profile_root,
        config.concurrent_session_cap,
        config.session_use_bound,
    );

    let fetcher = Box::new(WebDriverFetcher::default());

    let identity_rotator: Box<dyn IdentityRotator> = match &config.gluetun_base_url {
        Some(base_url) => Box::new(GluetunRotator::new(base_url.clone())),
        None => Box::new(NoopRotator),
    };

    let mailer = Box::new(
        LettreMailer::new(
            &config.smtp_host,
            config.smtp_port,
            &config.smtp_username,
            &config.smtp_password,
            config.smtp_from.clone(),
        )
        .map_err(|e| format!("failed to build SMTP transport: {e}"))?,
    );
    let signer = link_signer::LinkSigner::new(config.link_signing_secret.clone());
    let notifier = Notifier::new(
        store.clone(),
        mailer,
        signer,
        Box::new(SystemClock),
        config.public_base_url.clone(),
        config.soft_debounce_window,
    );

    let default_zone: chrono_tz::Tz = config
        .default_zone
        .parse()
        .map_err(|_| format!("invalid DEFAULT_ZONE: {}", config.default_zone))?;

    let scheduler_config = SchedulerConfig {
        default_zone,
        base_tick_interval: config.base_tick_interval,
        cooldown_min: config.cooldown_min,
        cooldown_max: config.cooldown_max,
        pause_all_on_block: config.pause_all_on_block,
    };

    let scheduler = Scheduler::new(
        store,
        session_pool,
        fetcher,
        identity_rotator,
        notifier,
        Box::new(SystemClock),
        scheduler_config,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping scheduler...");
    let _ = shutdown_tx.send(());
    let _ = scheduler_task.await;

    Ok(())
}

/// Waits for SIGINT or, on unix, SIGTERM — whichever a supervisor
/// (systemd, Docker) sends first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("error waiting for ctrl_c: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("error installing SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
