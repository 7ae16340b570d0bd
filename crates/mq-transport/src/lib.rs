//! Per-backend transport adapters implementing the MQ façade's wire-level
//! contract: NATS Core, NATS JetStream, Redis Streams, Kafka.
//!
//! `mq-client` is the only intended caller of this crate; it pairs a
//! `Transport` with the handler pipeline defined in `mq-domain`.

pub mod config;
pub mod connector;
pub mod kafka;
pub mod nats_core;
pub mod nats_jetstream;
pub mod redis_streams;
pub mod transport;

pub use config::{Driver, JetStreamConfig, KafkaConfig, MqConfig, NatsCoreConfig, RedisStreamsConfig};
pub use transport::Transport;
