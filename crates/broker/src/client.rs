//! AMQP broker client (C1): connection/channel lifecycle, DLX/DLQ-aware
//! publish and consume, and fanout publish/subscribe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagework_core::config::BrokerConfig;

use crate::error::BrokerError;
use crate::message::{extract_trace, headers_with_trace};
use crate::topology::{declare_fanout_exchange, declare_queue};
use crate::traits::{Broker, BoxFuture, ConsumeOptions, Delivery, HandlerResult, PublishOptions};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const RECONNECT_SLEEP: Duration = Duration::from_secs(1);

/// Single shared connection per process; channels are per-operation and
/// disposed after use or on error (spec §4.1).
pub struct AmqpBroker {
    uri: String,
    broker_cfg: BrokerConfig,
    connection: Mutex<Option<Connection>>,
    shutdown: CancellationToken,
}

impl AmqpBroker {
    pub fn new(uri: impl Into<String>, broker_cfg: BrokerConfig, shutdown: CancellationToken) -> Self {
        Self {
            uri: uri.into(),
            broker_cfg,
            connection: Mutex::new(None),
            shutdown,
        }
    }

    /// Re-dial with capped exponential backoff until connected or cancelled.
    async fn ensure_connection(&self) -> Result<Connection, BrokerError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
        }

        let mut delay = INITIAL_BACKOFF;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(BrokerError::Cancelled("connect cancelled".into()));
            }

            let props = ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::current())
                .with_reactor(tokio_reactor_trait::Tokio);

            match Connection::connect(&self.uri, props).await {
                Ok(conn) => {
                    info!("connected to broker");
                    *guard = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(error = %e, delay_ms = delay.as_millis(), "broker connect failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            return Err(BrokerError::Cancelled("connect cancelled".into()));
                        }
                    }
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn channel(&self) -> Result<Channel, BrokerError> {
        let conn = self.ensure_connection().await?;
        Ok(conn.create_channel().await?)
    }
}

impl AmqpBroker {
    /// One publish attempt: open a channel, declare the queue, send. No
    /// retry — callers decide whether a failure is worth retrying.
    async fn publish_attempt<T>(&self, queue: &str, body: &T, opts: &PublishOptions) -> Result<(), BrokerError>
    where
        T: Serialize + Sync,
    {
        let payload = serde_json::to_vec(body)?;
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let field_table = headers_with_trace(&opts.trace_id, &opts.span_id, &headers);

        let ch = self.channel().await?;
        let cfg = BrokerConfig {
            dlq_enabled: opts.dlq_enabled,
            ..self.broker_cfg.clone()
        };
        declare_queue(&ch, queue, &cfg).await?;

        let mut props = BasicProperties::default().with_content_type("application/json".into());
        if opts.persistent {
            props = props.with_delivery_mode(2);
        }
        props = props.with_headers(field_table);

        ch.basic_publish("", queue, BasicPublishOptions::default(), &payload, props)
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish_with_retry<T>(
        &self,
        queue: &str,
        body: &T,
        opts: &PublishOptions,
    ) -> HandlerResult
    where
        T: Serialize + Sync,
    {
        let mut delay = INITIAL_BACKOFF;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(BrokerError::Cancelled("publish cancelled".into()));
            }

            match self.publish_attempt(queue, body, opts).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, queue, delay_ms = delay.as_millis(), "publish failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            return Err(BrokerError::Cancelled("publish cancelled".into()));
                        }
                    }
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn publish_once<T>(&self, queue: &str, body: &T, opts: &PublishOptions) -> HandlerResult
    where
        T: Serialize + Sync,
    {
        self.publish_attempt(queue, body, opts).await
    }

    async fn consume<T, F>(&self, queue: &str, opts: ConsumeOptions, handler: F) -> HandlerResult
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Delivery<T>) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let ch = match self.channel().await {
                Ok(ch) => ch,
                Err(BrokerError::Cancelled(_)) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "consume: failed to open channel, reconnecting");
                    tokio::time::sleep(RECONNECT_SLEEP).await;
                    continue;
                }
            };

            let cfg = BrokerConfig {
                dlq_enabled: opts.dlq_enabled,
                ..self.broker_cfg.clone()
            };
            if let Err(e) = declare_queue(&ch, queue, &cfg).await {
                warn!(error = %e, queue, "consume: failed to declare queue, retrying");
                tokio::time::sleep(RECONNECT_SLEEP).await;
                continue;
            }

            if let Err(e) = ch
                .basic_qos(opts.prefetch, BasicQosOptions::default())
                .await
            {
                warn!(error = %e, "consume: failed to set prefetch");
            }

            let mut consumer = match ch
                .basic_consume(
                    queue,
                    "stagework-consumer",
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, queue, "consume: basic_consume failed, reconnecting");
                    tokio::time::sleep(RECONNECT_SLEEP).await;
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    item = consumer.next() => item,
                    _ = self.shutdown.cancelled() => {
                        return Ok(());
                    }
                };

                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        warn!(error = %e, "consume: delivery error, reconnecting");
                        break;
                    }
                    None => {
                        warn!("consume: channel closed, reconnecting");
                        break;
                    }
                };

                dispatch_delivery(delivery, &handler, opts.dead_letter_on_fail, opts.handler_timeout)
                    .await;
            }

            tokio::time::sleep(RECONNECT_SLEEP).await;
        }
    }

    async fn get_one<T>(&self, queue: &str) -> Result<Option<Delivery<T>>, BrokerError>
    where
        T: DeserializeOwned + Send,
    {
        let ch = self.channel().await?;
        declare_queue(&ch, queue, &self.broker_cfg).await?;

        let Some(get_message) = ch.basic_get(queue, BasicGetOptions::default()).await? else {
            return Ok(None);
        };

        let delivery = get_message.delivery;
        let body: T = serde_json::from_slice(&delivery.data)?;
        let trace = extract_trace(&delivery.properties.headers().clone().unwrap_or_default());
        delivery.ack(BasicAckOptions::default()).await?;

        Ok(Some(Delivery {
            body,
            trace,
            headers: BTreeMap::new(),
            redelivered: delivery.redelivered,
        }))
    }

    async fn publish_fanout<T>(&self, exchange: &str, body: &T) -> HandlerResult
    where
        T: Serialize + Sync,
    {
        let payload = serde_json::to_vec(body)?;
        let ch = self.channel().await?;
        declare_fanout_exchange(&ch, exchange).await?;

        let props = BasicProperties::default().with_content_type("application/json".into());
        ch.basic_publish(exchange, "", BasicPublishOptions::default(), &payload, props)
            .await?
            .await?;
        Ok(())
    }

    async fn subscribe_fanout<T, F>(&self, exchange: &str, handler: F) -> HandlerResult
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Delivery<T>) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let ch = match self.channel().await {
                Ok(ch) => ch,
                Err(BrokerError::Cancelled(_)) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "subscribe_fanout: failed to open channel, reconnecting");
                    tokio::time::sleep(RECONNECT_SLEEP).await;
                    continue;
                }
            };

            if let Err(e) = declare_fanout_exchange(&ch, exchange).await {
                warn!(error = %e, exchange, "subscribe_fanout: failed to declare exchange");
                tokio::time::sleep(RECONNECT_SLEEP).await;
                continue;
            }

            // Exclusive, auto-delete queue bound to the exchange — every
            // subscriber gets its own copy of every message.
            let queue = match ch
                .queue_declare(
                    "",
                    lapin::options::QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(q) => q,
                Err(e) => {
                    warn!(error = %e, "subscribe_fanout: failed to declare subscriber queue");
                    tokio::time::sleep(RECONNECT_SLEEP).await;
                    continue;
                }
            };

            if let Err(e) = ch
                .queue_bind(
                    queue.name().as_str(),
                    exchange,
                    "",
                    lapin::options::QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                warn!(error = %e, "subscribe_fanout: failed to bind subscriber queue");
                tokio::time::sleep(RECONNECT_SLEEP).await;
                continue;
            }

            let mut consumer = match ch
                .basic_consume(
                    queue.name().as_str(),
                    "stagework-fanout-subscriber",
                    BasicConsumeOptions {
                        no_ack: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "subscribe_fanout: basic_consume failed");
                    tokio::time::sleep(RECONNECT_SLEEP).await;
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    item = consumer.next() => item,
                    _ = self.shutdown.cancelled() => {
                        return Ok(());
                    }
                };

                match next {
                    Some(Ok(delivery)) => {
                        if let Ok(body) = serde_json::from_slice::<T>(&delivery.data) {
                            let trace = extract_trace(
                                &delivery.properties.headers().clone().unwrap_or_default(),
                            );
                            let d = Delivery {
                                body,
                                trace,
                                headers: BTreeMap::new(),
                                redelivered: delivery.redelivered,
                            };
                            if let Err(e) = handler(d).await {
                                debug!(error = %e, "fanout handler returned error (auto-acked already)");
                            }
                        } else {
                            debug!("fanout: dropping undecodable snapshot");
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "subscribe_fanout: delivery error, reconnecting");
                        break;
                    }
                    None => {
                        warn!("subscribe_fanout: channel closed, reconnecting");
                        break;
                    }
                }
            }

            tokio::time::sleep(RECONNECT_SLEEP).await;
        }
    }
}

async fn dispatch_delivery<T, F>(
    delivery: LapinDelivery,
    handler: &Arc<F>,
    dead_letter_on_fail: bool,
    timeout: Option<Duration>,
) where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Delivery<T>) -> BoxFuture<'static, HandlerResult> + Send + Sync + ?Sized + 'static,
{
    let body: Result<T, _> = serde_json::from_slice(&delivery.data);
    let Ok(body) = body else {
        warn!("poison message: ack-to-dlq (malformed JSON body)");
        let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
        return;
    };

    let trace = extract_trace(&delivery.properties.headers().clone().unwrap_or_default());
    let typed = Delivery {
        body,
        trace,
        headers: BTreeMap::new(),
        redelivered: delivery.redelivered,
    };

    let fut = handler(typed);
    let result = match timeout {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(r) => r,
            Err(_) => Err(BrokerError::HandlerTimeout(d)),
        },
        None => fut.await,
    };

    match result {
        Ok(()) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                warn!(error = %e, "failed to ack delivery");
            }
        }
        Err(e) => {
            warn!(error = %e, dead_letter_on_fail, "handler failed");
            let nack = delivery.nack(BasicNackOptions {
                requeue: !dead_letter_on_fail,
                ..Default::default()
            });
            if let Err(e) = nack.await {
                warn!(error = %e, "failed to nack delivery");
            }
        }
    }
}
