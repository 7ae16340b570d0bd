//! Message, Subscription and handler-pipeline core of the MQ façade.
//!
//! This crate is transport-agnostic: it knows nothing about NATS, Redis or
//! Kafka. `mq-transport` builds the per-backend adapters on top of the
//! primitives defined here; `mq-client` composes a transport with this
//! crate's pipeline into the public façade.

pub mod capabilities;
pub mod dlq;
pub mod error;
pub mod headers;
pub mod log;
pub mod message;
pub mod metrics;
pub mod options;
pub mod pipeline;
pub mod subscription;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use capabilities::Capabilities;
pub use dlq::dead_letter;
pub use error::MqError;
pub use headers::Headers;
pub use message::{Backend, DeliveryAck, Message, NoopAck};
pub use metrics::{MetricsSink, NoopMetrics};
pub use options::{DeadLetterPolicy, PublishOptions, RetryConfig, SubscribeOptions};
pub use pipeline::{
    auto_ack_nak, compose, handler_fn, logging, recover, retry, BoxFuture, Handler, Middleware,
    Publisher,
};
pub use subscription::{new_subscription, Subscription, SubscriptionControl, SubscriptionState};
