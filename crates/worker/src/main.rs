//! SchoolPay Background Worker
//!
//! Handles scheduled jobs including:
//! - Fee structure re-propagation for the current academic year (daily at 01:30 UTC)
//! - Ledger invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use schoolpay_ledger::{phone, propagator, FeeStructurePropagator, InvariantChecker, Stores};
use schoolpay_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting SchoolPay Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let country_code = env_or("PHONE_COUNTRY_CODE", phone::DEFAULT_COUNTRY_CODE);
    let concurrency = env_or(
        "PROPAGATION_CONCURRENCY",
        &propagator::DEFAULT_CONCURRENCY.to_string(),
    )
    .parse::<usize>()?;

    // Fail at startup rather than on the first nightly run
    let configured_year = std::env::var("CURRENT_ACADEMIC_YEAR").ok();
    let year = jobs::academic_year(configured_year.as_deref(), OffsetDateTime::now_utc())?;
    info!(academic_year = year, concurrency, "Worker configuration loaded");

    // Create database pool
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let stores = Stores::postgres(pool.clone(), &country_code);
    let propagator = Arc::new(FeeStructurePropagator::new(&stores, concurrency));
    let checker = Arc::new(InvariantChecker::new(pool));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Re-propagate every class schedule (daily at 01:30 UTC)
    let nightly_propagator = propagator.clone();
    scheduler
        .add(Job::new_async("0 30 1 * * *", move |_uuid, _l| {
            let propagator = nightly_propagator.clone();
            let configured_year = configured_year.clone();
            Box::pin(async move {
                match jobs::academic_year(configured_year.as_deref(), OffsetDateTime::now_utc()) {
                    Ok(year) => jobs::propagate_all(&propagator, year).await,
                    Err(e) => error!(error = %e, "Skipping fee structure propagation"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Fee structure propagation (daily at 01:30 UTC)");

    // Job 2: Ledger invariant checks (hourly)
    let hourly_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = hourly_checker.clone();
            Box::pin(async move {
                jobs::check_invariants(&checker).await;
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("SchoolPay Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
