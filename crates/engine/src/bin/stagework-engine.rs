//! stagework-engine — the pipeline-execution control plane process.
//!
//! Runs the scheduler, the two result/status ingestors and the pending
//! watchdog side by side in one process, sharing a Postgres pool and an
//! AMQP connection. The worker registry's bootstrap/heartbeat surface
//! (`stagework-registry`) is a library consumed by the out-of-scope API
//! process, not wired up here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use stagework_alerts::{AlertSink, DedupingAlertSink, LoggingAlertSink};
use stagework_broker::AmqpBroker;
use stagework_engine::{ingest, scheduler, watchdog};
use stagework_store::Store;

#[derive(Parser, Debug)]
#[command(name = "stagework-engine", version, about)]
struct Cli {
    /// Shutdown grace period in seconds, waited after cancellation before
    /// the process exits forcibly.
    #[arg(long, env = "ENGINE_SHUTDOWN_TIMEOUT_S", default_value_t = 10)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    stagework_core::config::load_dotenv();
    let cli = Cli::parse();
    let config = stagework_core::Config::from_env();
    config.log_summary();
    if config.app_id.is_empty() {
        anyhow::bail!("APP_ID is required");
    }

    let pool = stagework_store::init_pg_pool(&config.database).await?;
    let shutdown = CancellationToken::new();

    let broker = Arc::new(AmqpBroker::new(config.rabbit.url.clone(), config.broker.clone(), shutdown.clone()));
    let alert_sink: Arc<dyn AlertSink> =
        Arc::new(DedupingAlertSink::new(LoggingAlertSink, ChronoDuration::seconds(60)));
    let store = Arc::new(Store::new(pool, alert_sink));

    let scheduler_handle = {
        let store = store.clone();
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        let poll_interval = Duration::from_secs(config.scheduler.poll_interval_s);
        tokio::spawn(async move { scheduler::run(&store, broker.as_ref(), poll_interval, shutdown).await })
    };

    let result_ingestor_handle = {
        let store = store.clone();
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { ingest::run_result_ingestor(store, broker, shutdown).await })
    };

    let status_ingestor_handle = {
        let store = store.clone();
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { ingest::run_status_ingestor(store, broker, shutdown).await })
    };

    let watchdog_handle = {
        let store = store.clone();
        let shutdown = shutdown.clone();
        let timeout = ChronoDuration::seconds(config.watchdog.stage_pending_timeout_s as i64);
        tokio::spawn(async move { watchdog::run(&store, timeout, shutdown).await })
    };

    info!("stagework-engine started");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    let grace = Duration::from_secs(cli.shutdown_timeout);
    let _ = tokio::time::timeout(
        grace,
        futures::future::join4(scheduler_handle, result_ingestor_handle, status_ingestor_handle, watchdog_handle),
    )
    .await;

    info!("stagework-engine exited cleanly");
    Ok(())
}
