//! Public façade: configuration, transport selection, middleware wiring,
//! and `subscribeChan`, per spec §4.4.
//!
//! This is the crate application code depends on. It composes a
//! `mq_transport::Transport` with the `mq_domain` pipeline and exposes the
//! single entry points `publish`, `subscribe`, `subscribe_chan`, `close`.

mod chan;
mod client;

pub use client::Client;
pub use mq_domain::{
    compose, handler_fn, recover, DeadLetterPolicy, Handler, Headers, Message, Middleware,
    MqError, PublishOptions, RetryConfig, Subscription, SubscribeOptions,
};
pub use mq_transport::{Driver, JetStreamConfig, KafkaConfig, MqConfig, NatsCoreConfig, RedisStreamsConfig};
