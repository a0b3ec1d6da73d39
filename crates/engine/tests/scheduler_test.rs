//! Scheduler tick tests (spec §4.3): claims the earliest ready stage,
//! resolves the owning pipeline to build the `StageNext` queue name and
//! `prevStageOutput`, and fans the refreshed snapshot out. Requires a live
//! Postgres reachable via `DATABASE_URL`; `sqlx::test` provisions and
//! migrates a scratch database per test, reusing the store crate's schema.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use stagework_alerts::LoggingAlertSink;
use stagework_broker::{BoxFuture, Broker, BrokerError, ConsumeOptions, Delivery, HandlerResult, PublishOptions};
use stagework_core::wire::StageNextMessage;
use stagework_core::{ContextItem, CreatePipelineRequest, CreateStageRequest, StageOptions};
use stagework_engine::scheduler;
use stagework_store::Store;

/// Records the queue name and decoded body of every `publish_with_retry`
/// call; everything else no-ops.
struct RecordingBroker {
    published: Mutex<Vec<(String, serde_json::Value)>>,
    fanout_calls: AtomicUsize,
}

impl RecordingBroker {
    fn new() -> Self {
        Self { published: Mutex::new(Vec::new()), fanout_calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn publish_with_retry<T>(&self, queue: &str, body: &T, _opts: &PublishOptions) -> HandlerResult
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(body).expect("serializable body");
        self.published.lock().unwrap().push((queue.to_string(), value));
        Ok(())
    }

    async fn publish_once<T>(&self, _queue: &str, _body: &T, _opts: &PublishOptions) -> HandlerResult
    where
        T: Serialize + Sync,
    {
        Ok(())
    }

    async fn consume<T, F>(&self, _queue: &str, _opts: ConsumeOptions, _handler: F) -> HandlerResult
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Delivery<T>) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        Ok(())
    }

    async fn get_one<T>(&self, _queue: &str) -> Result<Option<Delivery<T>>, BrokerError>
    where
        T: DeserializeOwned + Send,
    {
        Ok(None)
    }

    async fn publish_fanout<T>(&self, _exchange: &str, _body: &T) -> HandlerResult
    where
        T: Serialize + Sync,
    {
        self.fanout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe_fanout<T, F>(&self, _exchange: &str, _handler: F) -> HandlerResult
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Delivery<T>) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        Ok(())
    }
}

fn two_stage_request() -> CreatePipelineRequest {
    CreatePipelineRequest {
        name: "p1".into(),
        trace_id: Some("trace-xyz".into()),
        application_id: "app1".into(),
        is_event: false,
        stages: vec![
            CreateStageRequest {
                name: "a".into(),
                stage_handler_name: "h1".into(),
                input: Some("seed".into()),
                options: StageOptions::default(),
            },
            CreateStageRequest {
                name: "b".into(),
                stage_handler_name: "h2".into(),
                input: None,
                options: StageOptions::default(),
            },
        ],
        context: vec![ContextItem { key: "k".into(), value: "v".into(), value_type: "string".into() }],
        keywords: vec![],
    }
}

#[sqlx::test(migrations = "../store/migrations")]
async fn claims_and_publishes_first_ready_stage(pool: PgPool) {
    let store = Store::new(pool, Arc::new(LoggingAlertSink));
    store.create_pipeline(two_stage_request()).await.unwrap();

    let broker = Arc::new(RecordingBroker::new());
    let shutdown = CancellationToken::new();

    let run_shutdown = shutdown.clone();
    let run_store = store;
    let run_broker = broker.clone();
    let handle = tokio::spawn(async move {
        scheduler::run(&run_store, run_broker.as_ref(), Duration::from_millis(20), run_shutdown).await;
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    handle.await.unwrap();

    let published = broker.published.lock().unwrap();
    assert_eq!(published.len(), 1, "only the first stage should have become ready");
    let (queue, body) = &published[0];
    assert_eq!(queue, "app1_h1_StageNext");

    let msg: StageNextMessage = serde_json::from_value(body.clone()).unwrap();
    assert_eq!(msg.app_id, "app1");
    assert_eq!(msg.trace_id, "trace-xyz");
    assert_eq!(msg.stage_handler_name, "h1");
    assert_eq!(msg.input, "seed");
    assert_eq!(msg.prev_stage_output, "", "first stage has no predecessor output");

    assert_eq!(broker.fanout_calls.load(Ordering::SeqCst), 1, "snapshot fan-out runs once per publish");
}
