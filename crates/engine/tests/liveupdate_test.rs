//! Live-update fan-out tests (spec §4.6): both publish destinations are
//! attempted independently, and a failure on one never blocks the other.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use stagework_broker::{Broker, BoxFuture, BrokerError, ConsumeOptions, Delivery, HandlerResult, PublishOptions};
use stagework_core::{Pipeline, PipelineSnapshot, PipelineStatus};
use stagework_engine::liveupdate::broadcast_snapshot;

struct FakeBroker {
    queue_calls: AtomicUsize,
    fanout_calls: AtomicUsize,
    fail_queue: AtomicBool,
    fail_fanout: AtomicBool,
}

impl FakeBroker {
    fn new() -> Self {
        Self {
            queue_calls: AtomicUsize::new(0),
            fanout_calls: AtomicUsize::new(0),
            fail_queue: AtomicBool::new(false),
            fail_fanout: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn publish_with_retry<T>(&self, _queue: &str, _body: &T, _opts: &PublishOptions) -> HandlerResult
    where
        T: Serialize + Sync,
    {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queue.load(Ordering::SeqCst) {
            return Err(BrokerError::Config("boom".into()));
        }
        Ok(())
    }

    async fn publish_once<T>(&self, _queue: &str, _body: &T, _opts: &PublishOptions) -> HandlerResult
    where
        T: Serialize + Sync,
    {
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queue.load(Ordering::SeqCst) {
            return Err(BrokerError::Config("boom".into()));
        }
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
        if self.fail_fanout.load(Ordering::SeqCst) {
            return Err(BrokerError::Config("boom".into()));
        }
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

fn snapshot() -> PipelineSnapshot {
    PipelineSnapshot {
        pipeline: Pipeline {
            id: 1,
            name: "p1".into(),
            trace_id: "t1".into(),
            application_id: "app1".into(),
            status: PipelineStatus::Running,
            created_at: chrono::Utc::now(),
            finished_at: None,
            is_event: false,
            updated_at: chrono::Utc::now(),
            context: vec![],
            keywords: vec![],
        },
        stages: vec![],
        logs: vec![],
    }
}

#[tokio::test]
async fn broadcasts_to_both_destinations() {
    let broker = FakeBroker::new();
    broadcast_snapshot(&broker, &snapshot()).await;

    assert_eq!(broker.queue_calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.fanout_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fanout_failure_does_not_block_queue_publish() {
    let broker = FakeBroker::new();
    broker.fail_fanout.store(true, Ordering::SeqCst);
    broadcast_snapshot(&broker, &snapshot()).await;

    assert_eq!(broker.queue_calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.fanout_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queue_failure_does_not_block_fanout_publish() {
    let broker = FakeBroker::new();
    broker.fail_queue.store(true, Ordering::SeqCst);
    broadcast_snapshot(&broker, &snapshot()).await;

    assert_eq!(broker.queue_calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.fanout_calls.load(Ordering::SeqCst), 1);
}
