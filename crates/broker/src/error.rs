use thiserror::Error;

/// Errors raised by the AMQP broker client.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed and reconnect exhausted cancellation: {0}")]
    Cancelled(String),

    #[error("handler timed out after {0:?}")]
    HandlerTimeout(std::time::Duration),

    #[error("config error: {0}")]
    Config(String),

    /// A delivery handler's own processing failed (e.g. the Store rejected
    /// the message); drives the same nack-to-DLQ path as a transport error.
    #[error("handler failed: {0}")]
    Handler(String),
}
