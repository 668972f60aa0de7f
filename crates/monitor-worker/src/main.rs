//! ReaderLoop Monitor Worker
//!
//! Periodically checks that validated reviews are still published:
//! 1. Loads monitoring records whose next check is due
//! 2. Asks the marketplace whether each review link still resolves
//! 3. Records the result; removals inside the guarantee window trigger
//!    replacement dispatch

mod sweeper;

use crate::sweeper::Sweeper;
use metrics_exporter_prometheus::PrometheusBuilder;
use readerloop_common::{
    collaborators::{ExistenceChecker, HttpExistenceChecker},
    config::AppConfig,
    db::DbPool,
    metrics, ReviewEngine, VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .json()
        .init();

    info!("Starting ReaderLoop Monitor Worker v{}", VERSION);

    let checker = HttpExistenceChecker::new(&config.monitoring)?;

    // Check for command line arguments for testing
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 2 && args[1] == "check" {
        // Check mode: probe a single review link
        let link = &args[2];
        match checker.still_published(link).await {
            Ok(published) => {
                println!("{}: {}", link, if published { "published" } else { "removed" });
            }
            Err(e) => {
                error!(error = %e, "Existence check failed");
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    if config.observability.metrics_port != 0 {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()?;
    }
    metrics::register_metrics();

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;

    let engine = ReviewEngine::from_config(&config, db).await?;
    let mut sweeper = Sweeper::new(engine, Arc::new(checker));

    if args.len() > 1 && args[1] == "once" {
        let report = sweeper.sweep().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(
        interval_secs = config.monitoring.poll_interval_secs,
        "Monitor worker ready, starting sweeps..."
    );

    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        sweeper.wait_if_open().await;

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                // Failures are counted by the sweeper
                let _ = sweeper.sweep().await;
            }
        }
    }

    info!("Monitor worker shutting down");
    Ok(())
}
