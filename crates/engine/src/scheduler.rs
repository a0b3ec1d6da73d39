//! Scheduler (C3, spec §4.3). One tick per `pollInterval`: claim the next
//! runnable stage, hand it to its handler queue, fan out the refreshed
//! snapshot. Runs as a single logical worker — `Store::get_stage_to_execute`
//! row-locks its selection, so multiple replicas of this loop stay safe.

use std::time::Duration;

use stagework_broker::{Broker, PublishOptions};
use stagework_core::wire::{self, StageNextMessage};
use stagework_store::Store;
use tokio_util::sync::CancellationToken;

use crate::liveupdate::broadcast_snapshot;

pub async fn run<B: Broker>(store: &Store, broker: &B, poll_interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("scheduler stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = tick(store, broker).await {
                    tracing::error!(error = %e, "scheduler tick failed");
                }
            }
        }
    }
}

async fn tick<B: Broker>(store: &Store, broker: &B) -> Result<(), crate::error::EngineError> {
    let Some(stage) = store.get_stage_to_execute().await? else {
        return Ok(());
    };

    // Every stage reachable through `create_pipeline` carries a pipeline,
    // which is where applicationId/traceId live (spec §3's nullable
    // `pipelineId` covers a standalone-event shape this repo's sole
    // ingestion path never actually produces). Stages without one can't be
    // addressed to a handler queue, so leave them Pending for inspection
    // rather than publish a malformed message.
    let Some(pipeline_id) = stage.pipeline_id else {
        tracing::warn!(stage_id = stage.id, "stage has no pipeline; cannot resolve StageNext queue");
        return Ok(());
    };

    let snapshot = match store.get_pipeline_with_stages(pipeline_id).await? {
        Some(s) => s,
        None => {
            tracing::warn!(stage_id = stage.id, pipeline_id, "pipeline vanished before publish");
            return Ok(());
        }
    };

    let prev_stage_output = snapshot
        .stages
        .iter()
        .find(|s| s.next_stage_id == Some(stage.id))
        .and_then(|s| s.output.clone())
        .unwrap_or_default();

    let queue = wire::stage_next_queue(&snapshot.pipeline.application_id, &stage.stage_handler_name);
    let msg = StageNextMessage {
        app_id: snapshot.pipeline.application_id.clone(),
        stage_id: stage.id,
        pipeline_id: stage.pipeline_id,
        trace_id: snapshot.pipeline.trace_id.clone(),
        span_id: stage.span_id.clone(),
        stage_handler_name: stage.stage_handler_name.clone(),
        input: stage.input.clone().unwrap_or_default(),
        prev_stage_output,
        context_items: snapshot.pipeline.context.clone(),
    };

    let opts = PublishOptions {
        dlq_enabled: true,
        persistent: true,
        trace_id: snapshot.pipeline.trace_id.clone(),
        span_id: stage.span_id.clone(),
    };
    if let Err(e) = broker.publish_with_retry(&queue, &msg, &opts).await {
        // Stage stays Pending; the watchdog reclaims it if it never advances.
        tracing::error!(error = %e, stage_id = stage.id, queue, "StageNext publish failed");
        return Ok(());
    }

    broadcast_snapshot(broker, &snapshot).await;

    Ok(())
}
