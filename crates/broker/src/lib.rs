pub mod client;
pub mod error;
pub mod message;
pub mod topology;
pub mod traits;

pub use client::AmqpBroker;
pub use error::BrokerError;
pub use message::{extract_trace, headers_with_trace, parse_traceparent, traceparent};
pub use topology::{declare_fanout_exchange, declare_queue};
pub use traits::{Broker, BoxFuture, ConsumeOptions, Delivery, HandlerResult, PublishOptions};
