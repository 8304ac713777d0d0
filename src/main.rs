//! LENDBOT: loan harvesting and bidding agent.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! validates credentials, then runs the job API and the job cleanup loop
//! until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lendbot::api;
use lendbot::config;
use lendbot::engine::{JobRegistry, LendingService};
use lendbot::marketplace::Marketplace;
use lendbot::storage::{JsonLoanStore, LoanStore, DEFAULT_LOANS_FILE};

const BANNER: &str = r#"
 _     _____ _   _ ____  ____   ___ _____
| |   | ____| \ | |  _ \| __ ) / _ \_   _|
| |   |  _| |  \| | | | |  _ \| | | || |
| |___| |___| |\  | |_| | |_) | |_| || |
|_____|_____|_| \_|____/|____/ \___/ |_|

  Loan harvesting and bidding agent
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        base_url = %cfg.marketplace.base_url,
        api_base_url = %cfg.marketplace.api_base_url,
        page_size = cfg.harvest.page_size,
        max_concurrent_jobs = cfg.jobs.max_concurrent_jobs,
        "LENDBOT starting up"
    );

    // -- Credentials (fatal, before any network traffic) -----------------

    let credentials = cfg
        .marketplace
        .credentials_from_env()
        .context("Marketplace credentials are not configured")?;
    if credentials.totp_secret().is_none() {
        warn!(
            env = %cfg.marketplace.totp_secret_env,
            "No TOTP secret configured; logins that require 2FA will fail"
        );
    }

    // -- Initialise components -------------------------------------------

    let marketplace = Marketplace::new(&cfg, credentials).context("Failed to build HTTP client")?;

    let store = JsonLoanStore::open(DEFAULT_LOANS_FILE).context("Failed to open loan store")?;
    info!(loans = store.count().await.unwrap_or(0), "Loan store ready");

    let registry = JobRegistry::new(&cfg.jobs);
    let service = Arc::new(LendingService::new(
        marketplace,
        Arc::new(store),
        registry.clone(),
        cfg.harvest.default_max_pages,
    ));

    // -- Background tasks ------------------------------------------------

    let shutdown = CancellationToken::new();
    let cleanup = registry.spawn_cleanup(cfg.jobs.cleanup_interval(), shutdown.clone());

    let api_handle = if cfg.api.enabled {
        let port = cfg.api.port;
        let token = shutdown.clone();
        let state = service.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve_api(state, port, token).await {
                error!(error = %e, "Job API failed");
            }
        }))
    } else {
        warn!("Job API disabled; nothing will submit jobs");
        None
    };

    info!("Running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received.");

    shutdown.cancel();
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Job API task panicked");
        }
    }
    if let Err(e) = cleanup.await {
        error!(error = %e, "Cleanup task panicked");
    }

    info!(jobs = registry.len(), "LENDBOT shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lendbot=info"));

    let json_logging = std::env::var("LENDBOT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
