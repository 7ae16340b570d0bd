//! External connector seam, per spec §6.
//!
//! `Connector` traits describe a borrowed, already-connected backend client.
//! Dial/pool/reconnect/health for that client is explicitly out of scope
//! for this crate (spec §1 Non-goals): each adapter's own `connect`
//! constructor (mirroring this workspace's `NatsMessageBus::connect`) opens
//! one connection directly and hands it to the transport, which never
//! retries or pools beyond what the underlying client library already
//! does internally. These traits exist so a caller that already manages
//! its own pooled/health-checked client can hand it in instead, without
//! this crate needing to know how that pooling works.

use async_nats::Client as NatsClient;
use rdkafka::producer::FutureProducer;
use redis::aio::ConnectionManager as RedisConnectionManager;

pub trait NatsConnector: Send + Sync {
    fn client(&self) -> &NatsClient;
}

pub trait RedisConnector: Send + Sync {
    fn manager(&self) -> &RedisConnectionManager;
}

pub trait KafkaConnector: Send + Sync {
    fn producer(&self) -> &FutureProducer;
}
