use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BrokerError;

/// Options accepted by `publish_with_retry`.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Declare the destination queue with a DLX/DLQ policy before publishing.
    pub dlq_enabled: bool,
    /// Mark the message persistent (survives broker restart).
    pub persistent: bool,
    /// Trace context to inject into AMQP headers.
    pub trace_id: String,
    pub span_id: String,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            dlq_enabled: true,
            persistent: true,
            trace_id: String::new(),
            span_id: String::new(),
        }
    }
}

/// Options accepted by `consume`.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub prefetch: u16,
    /// On handler failure: `true` routes to the DLX (bounded TTL retry),
    /// `false` requeues immediately on the same queue.
    pub dead_letter_on_fail: bool,
    pub handler_timeout: Option<Duration>,
    pub dlq_enabled: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 10,
            dead_letter_on_fail: true,
            handler_timeout: None,
            dlq_enabled: true,
        }
    }
}

/// A single inbound delivery, decoded and ready for handler dispatch.
pub struct Delivery<T> {
    pub body: T,
    pub trace: Option<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub redelivered: bool,
}

pub type HandlerResult = Result<(), BrokerError>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The broker abstraction the rest of the engine programs against (C1).
///
/// A real implementation (`AmqpBroker`) wraps a `lapin::Connection`; tests
/// use an in-memory fake so the scheduler/ingestor/watchdog loops can run
/// without a live RabbitMQ.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish never returns until the send succeeds or the broker is
    /// cancelled — transient errors retry with exponential backoff.
    async fn publish_with_retry<T>(
        &self,
        queue: &str,
        body: &T,
        opts: &PublishOptions,
    ) -> HandlerResult
    where
        T: Serialize + Sync;

    /// Single-attempt publish: no retry, no backoff. For best-effort paths
    /// (spec §4.6 live-update fan-out) that must never block their caller
    /// on broker downtime.
    async fn publish_once<T>(&self, queue: &str, body: &T, opts: &PublishOptions) -> HandlerResult
    where
        T: Serialize + Sync;

    /// Run a consume loop on `queue` until cancelled. `handler` is invoked
    /// per delivery; its `Ok`/`Err` drives ack/nack per `opts`.
    async fn consume<T, F>(&self, queue: &str, opts: ConsumeOptions, handler: F) -> HandlerResult
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Delivery<T>) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static;

    /// Fetch at most one message without starting a consume loop (used by
    /// tests and admin tooling; not on the engine's hot path).
    async fn get_one<T>(&self, queue: &str) -> Result<Option<Delivery<T>>, BrokerError>
    where
        T: DeserializeOwned + Send;

    /// Publish to a fanout exchange — every bound subscriber queue gets a
    /// copy (spec §4.6).
    async fn publish_fanout<T>(&self, exchange: &str, body: &T) -> HandlerResult
    where
        T: Serialize + Sync;

    /// Subscribe to a fanout exchange via an exclusive, auto-delete queue.
    /// Deliveries are auto-acked — fan-out snapshots are idempotent
    /// replacements, so there is nothing to retry.
    async fn subscribe_fanout<T, F>(&self, exchange: &str, handler: F) -> HandlerResult
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Delivery<T>) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static;
}
