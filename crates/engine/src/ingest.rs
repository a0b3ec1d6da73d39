//! Result/status ingestors (C4, spec §4.4). Two consumer loops on the
//! fixed `StageResult` and `StageSetStatus` queues, dispatching into the
//! matching Store mutator and fanning the refreshed snapshot back out.

use std::sync::Arc;
use std::time::Duration;

use stagework_broker::{Broker, ConsumeOptions, Delivery};
use stagework_core::wire::{SetStageStatusMessage, StageResultMessage, STAGE_RESULT_QUEUE, STAGE_SET_STATUS_QUEUE};
use stagework_store::Store;
use tokio_util::sync::CancellationToken;

use crate::liveupdate::broadcast_snapshot;

pub async fn run_result_ingestor<B>(store: Arc<Store>, broker: Arc<B>, shutdown: CancellationToken)
where
    B: Broker + 'static,
{
    let opts = ConsumeOptions {
        prefetch: 10,
        dead_letter_on_fail: true,
        handler_timeout: Some(Duration::from_secs(30)),
        dlq_enabled: true,
    };

    run_consumer(store, broker, STAGE_RESULT_QUEUE, opts, shutdown, |store, broker, delivery: Delivery<StageResultMessage>| {
        Box::pin(async move {
            let snapshot = store.update_stage_result(delivery.body).await.map_err(|e| {
                stagework_broker::BrokerError::Handler(e.to_string())
            })?;
            broadcast_snapshot(broker.as_ref(), &snapshot).await;
            Ok(())
        })
    })
    .await;
}

pub async fn run_status_ingestor<B>(store: Arc<Store>, broker: Arc<B>, shutdown: CancellationToken)
where
    B: Broker + 'static,
{
    let opts = ConsumeOptions {
        prefetch: 10,
        dead_letter_on_fail: true,
        handler_timeout: Some(Duration::from_secs(15)),
        dlq_enabled: true,
    };

    run_consumer(store, broker, STAGE_SET_STATUS_QUEUE, opts, shutdown, |store, broker, delivery: Delivery<SetStageStatusMessage>| {
        Box::pin(async move {
            let snapshot = store.update_stage_status(delivery.body).await.map_err(|e| {
                stagework_broker::BrokerError::Handler(e.to_string())
            })?;
            broadcast_snapshot(broker.as_ref(), &snapshot).await;
            Ok(())
        })
    })
    .await;
}

/// Shared consume-or-cancel shape for both ingestors; `handler` owns the
/// Store-call-then-fan-out sequence for its message type.
async fn run_consumer<B, T, H>(
    store: Arc<Store>,
    broker: Arc<B>,
    queue: &str,
    opts: ConsumeOptions,
    shutdown: CancellationToken,
    handler: H,
) where
    B: Broker + 'static,
    T: serde::de::DeserializeOwned + Send + 'static,
    H: Fn(Arc<Store>, Arc<B>, Delivery<T>) -> stagework_broker::BoxFuture<'static, stagework_broker::HandlerResult>
        + Send
        + Sync
        + 'static,
{
    let broker_for_dispatch = broker.clone();
    let consume = async {
        let result = broker
            .consume(queue, opts, move |delivery: Delivery<T>| {
                let store = store.clone();
                let broker = broker_for_dispatch.clone();
                handler(store, broker, delivery)
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, queue, "ingestor consume loop exited");
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => {
            tracing::info!(queue, "ingestor stopping");
        }
        _ = consume => {}
    }
}
