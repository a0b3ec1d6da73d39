//! Idempotent queue/exchange declaration, including the DLX/DLQ policy
//! described in spec §4.1.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};

use stagework_core::config::BrokerConfig;

use crate::error::BrokerError;

/// Declare `queue` as a durable queue. When `dlq` is enabled, also declares
/// `<queue>.dlx` (direct exchange) and `<queue>.dlq` (durable queue) bound
/// with routing key `queue`, and points the main queue's
/// `x-dead-letter-exchange` at `<queue>.dlx`. The DLQ itself carries
/// `x-message-ttl = dlq_ttl` and redirects back to the main queue via the
/// default exchange after the TTL elapses (bounded retry via TTL loop).
pub async fn declare_queue(
    channel: &Channel,
    queue: &str,
    cfg: &BrokerConfig,
) -> Result<(), BrokerError> {
    let mut main_args = FieldTable::default();

    if cfg.dlq_enabled {
        let dlx = stagework_core::dlx_name(queue);
        let dlq = stagework_core::dlq_name(queue);

        channel
            .exchange_declare(
                &dlx,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let mut dlq_args = FieldTable::default();
        dlq_args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt((cfg.dlq_message_ttl_s * 1000) as i32),
        );
        dlq_args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
        dlq_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(queue.into()),
        );

        channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                dlq_args,
            )
            .await?;

        channel
            .queue_bind(&dlq, &dlx, queue, QueueBindOptions::default(), FieldTable::default())
            .await?;

        main_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.into()),
        );
    }

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            main_args,
        )
        .await?;

    Ok(())
}

/// Declare a durable fanout exchange (spec §4.6's `StageUpdated.fanout`).
pub async fn declare_fanout_exchange(channel: &Channel, exchange: &str) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}
