//! Live-update fan-out (C6, spec §4.6). Broadcasts a pipeline snapshot to
//! the durable `StageUpdated` queue and the ephemeral `StageUpdated.fanout`
//! exchange. Consumers treat each snapshot as an idempotent replacement
//! keyed by `pipelineId`.

use stagework_broker::{Broker, PublishOptions};
use stagework_core::{wire, PipelineSnapshot};

/// Publishes to both destinations independently; a failure on either is
/// logged, not propagated — fan-out is best-effort by design (spec §4.6).
/// Uses `publish_once` rather than `publish_with_retry`: a retrying publish
/// never returns during a broker outage, which would block the caller
/// (the scheduler tick, an ingestor) indefinitely.
pub async fn broadcast_snapshot<B: Broker>(broker: &B, snapshot: &PipelineSnapshot) {
    let opts = PublishOptions { dlq_enabled: true, persistent: true, ..Default::default() };
    if let Err(e) = broker.publish_once(wire::STAGE_UPDATED_QUEUE, snapshot, &opts).await {
        tracing::warn!(error = %e, pipeline_id = snapshot.pipeline.id, "StageUpdated publish failed");
    }

    if let Err(e) = broker.publish_fanout(wire::STAGE_UPDATED_FANOUT_EXCHANGE, snapshot).await {
        tracing::warn!(error = %e, pipeline_id = snapshot.pipeline.id, "StageUpdated fanout publish failed");
    }
}
