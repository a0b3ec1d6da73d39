//! Pending watchdog (C5, spec §4.5). Ticks at half the pending timeout and
//! reclaims stages stuck in `Pending` with no delivered result. Keeps no
//! per-stage state in memory — each tick re-derives the stuck set from the
//! database.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use stagework_store::Store;
use tokio_util::sync::CancellationToken;

pub async fn run(store: &Store, stage_pending_timeout: ChronoDuration, shutdown: CancellationToken) {
    let tick_interval = half(stage_pending_timeout);
    let mut ticker = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("watchdog stopping");
                return;
            }
            _ = ticker.tick() => {
                match store.mark_pending_too_long(stage_pending_timeout).await {
                    Ok(0) => {}
                    Ok(n) => tracing::warn!(count = n, "watchdog failed stuck pending stages"),
                    Err(e) => tracing::error!(error = %e, "watchdog tick failed"),
                }
            }
        }
    }
}

fn half(d: ChronoDuration) -> Duration {
    let secs = d.num_seconds().max(2) / 2;
    Duration::from_secs(secs as u64)
}
